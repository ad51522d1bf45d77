use {
  self::{
    block_cache::BlockCache,
    entry::{
      BalanceValue, BlockHashValue, DuneIdValue, Entry, TxidValue, UtxoEntry, UtxoEntryValue,
    },
    rtx::Rtx,
    updater::Updater,
  },
  bitcoincore_rpc::Auth,
  redb::{
    Database, DatabaseError, ReadableTable, StorageError, TableDefinition, WriteTransaction,
  },
  super::*,
  url::Url,
};

pub(crate) use self::entry::DuneEntry;
pub use self::event::{Event, EventKind};

pub(crate) mod block_cache;
pub(crate) mod entry;
mod event;
mod rtx;
mod updater;

const SCHEMA_VERSION: u64 = 1;

/// Process-reserved address rows, seeded when the database is created.
pub(crate) const COINBASE_ADDRESS_ID: u64 = 1;
pub(crate) const OP_RETURN_ADDRESS_ID: u64 = 2;
pub(crate) const UNKNOWN_ADDRESS_ID: u64 = 3;

pub(crate) const RESERVED_ADDRESSES: [(u64, &str); 3] = [
  (COINBASE_ADDRESS_ID, "COINBASE"),
  (OP_RETURN_ADDRESS_ID, "OP_RETURN"),
  (UNKNOWN_ADDRESS_ID, "UNKNOWN"),
];

macro_rules! define_table {
  ($name:ident, $key:ty, $value:ty) => {
    const $name: TableDefinition<$key, $value> = TableDefinition::new(stringify!($name));
  };
}

define_table! { HEIGHT_TO_BLOCK_HASH, u32, &BlockHashValue }
define_table! { STATISTIC_TO_COUNT, u64, u64 }
define_table! { ADDRESS_TO_ID, &str, u64 }
define_table! { ID_TO_ADDRESS, u64, &str }
define_table! { TRANSACTION_HASH_TO_ID, &TxidValue, u64 }
define_table! { ID_TO_TRANSACTION_HASH, u64, &TxidValue }
define_table! { TRANSACTION_OUT_TO_UTXO, (u64, u32), UtxoEntryValue }
define_table! { UTXO_ID_TO_DUNE_BALANCES, u64, &[u8] }
define_table! { DUNE_ID_TO_DUNE_ENTRY, DuneIdValue, &[u8] }
define_table! { DUNE_TO_DUNE_ID, u128, DuneIdValue }
define_table! { ADDRESS_DUNE_TO_BALANCE, (u64, DuneIdValue), BalanceValue }
define_table! { EVENT_ID_TO_EVENT, u64, &[u8] }

#[derive(Copy, Clone)]
#[repr(u64)]
pub(crate) enum Statistic {
  Schema = 0,
  Dunes = 1,
  NextAddressId = 2,
  NextTransactionId = 3,
  NextUtxoId = 4,
  NextEventId = 5,
}

impl Statistic {
  fn key(self) -> u64 {
    self.into()
  }
}

impl From<Statistic> for u64 {
  fn from(statistic: Statistic) -> Self {
    statistic as u64
  }
}

trait BitcoinCoreRpcResultExt<T> {
  fn into_option(self) -> Result<Option<T>>;
}

impl<T> BitcoinCoreRpcResultExt<T> for Result<T, bitcoincore_rpc::Error> {
  fn into_option(self) -> Result<Option<T>> {
    match self {
      Ok(ok) => Ok(Some(ok)),
      Err(bitcoincore_rpc::Error::JsonRpc(bitcoincore_rpc::jsonrpc::error::Error::Rpc(
        bitcoincore_rpc::jsonrpc::error::RpcError { code: -8, .. },
      ))) => Ok(None),
      Err(bitcoincore_rpc::Error::JsonRpc(bitcoincore_rpc::jsonrpc::error::Error::Rpc(
        bitcoincore_rpc::jsonrpc::error::RpcError { message, .. },
      )))
        if message.ends_with("not found") =>
      {
        Ok(None)
      }
      Err(err) => Err(err.into()),
    }
  }
}

pub struct Index {
  auth: Auth,
  chain: Chain,
  client: Client,
  database: Database,
  first_dune_height: u32,
  height_limit: Option<u32>,
  nr_parallel_requests: usize,
  rpc_url: String,
}

impl Index {
  pub fn open(options: &Options) -> Result<Self> {
    let rpc_url = options.rpc_url();
    let cookie_file = options.cookie_file()?;

    let auth = if cookie_file.exists() {
      log::info!(
        "Connecting to Bitcoin Core RPC server at {rpc_url} using credentials from `{}`",
        cookie_file.display()
      );

      Auth::CookieFile(cookie_file)
    } else if let Ok(url) = Url::parse(&rpc_url) {
      log::info!(
        "Connecting to Bitcoin Core RPC server at {rpc_url} using credentials from the url"
      );

      Auth::UserPass(
        url.username().to_string(),
        url.password().map(|x| x.to_string()).unwrap_or_default(),
      )
    } else {
      Auth::None
    };

    let client = Client::new(&rpc_url, auth.clone()).context("failed to connect to RPC URL")?;

    let data_dir = options.data_dir()?;

    if let Err(err) = fs::create_dir_all(&data_dir) {
      bail!("failed to create data dir `{}`: {err}", data_dir.display());
    }

    let path = if let Some(path) = &options.index {
      path.clone()
    } else {
      data_dir.join("index.redb")
    };

    let database = match Database::builder().open(&path) {
      Ok(database) => {
        let schema_version = database
          .begin_read()?
          .open_table(STATISTIC_TO_COUNT)?
          .get(&Statistic::Schema.key())?
          .map(|x| x.value())
          .unwrap_or(0);

        match schema_version.cmp(&SCHEMA_VERSION) {
          cmp::Ordering::Less => bail!(
            "index at `{}` appears to have been built with an older, incompatible version of duned, consider deleting and rebuilding the index: index schema {schema_version}, duned schema {SCHEMA_VERSION}",
            path.display()
          ),
          cmp::Ordering::Greater => bail!(
            "index at `{}` appears to have been built with a newer, incompatible version of duned, consider updating duned: index schema {schema_version}, duned schema {SCHEMA_VERSION}",
            path.display()
          ),
          cmp::Ordering::Equal => {}
        }

        database
      }
      Err(DatabaseError::Storage(StorageError::Io(error)))
        if error.kind() == io::ErrorKind::NotFound =>
      {
        let mut builder = Database::builder();

        if let Some(db_cache_size) = options.db_cache_size {
          builder.set_cache_size(db_cache_size);
        }

        let database = builder.create(&path)?;

        let tx = database.begin_write()?;

        tx.open_table(HEIGHT_TO_BLOCK_HASH)?;
        tx.open_table(TRANSACTION_HASH_TO_ID)?;
        tx.open_table(ID_TO_TRANSACTION_HASH)?;
        tx.open_table(TRANSACTION_OUT_TO_UTXO)?;
        tx.open_table(UTXO_ID_TO_DUNE_BALANCES)?;
        tx.open_table(DUNE_ID_TO_DUNE_ENTRY)?;
        tx.open_table(DUNE_TO_DUNE_ID)?;
        tx.open_table(ADDRESS_DUNE_TO_BALANCE)?;
        tx.open_table(EVENT_ID_TO_EVENT)?;

        {
          let mut address_to_id = tx.open_table(ADDRESS_TO_ID)?;
          let mut id_to_address = tx.open_table(ID_TO_ADDRESS)?;

          for (id, address) in RESERVED_ADDRESSES {
            address_to_id.insert(address, id)?;
            id_to_address.insert(id, address)?;
          }

          let mut statistics = tx.open_table(STATISTIC_TO_COUNT)?;
          statistics.insert(&Statistic::Schema.key(), &SCHEMA_VERSION)?;
          statistics.insert(&Statistic::Dunes.key(), &0)?;
          statistics.insert(
            &Statistic::NextAddressId.key(),
            &(RESERVED_ADDRESSES.len() as u64 + 1),
          )?;
          statistics.insert(&Statistic::NextTransactionId.key(), &1)?;
          statistics.insert(&Statistic::NextUtxoId.key(), &1)?;
          statistics.insert(&Statistic::NextEventId.key(), &1)?;
        }

        tx.commit()?;

        database
      }
      Err(error) => return Err(error.into()),
    };

    Ok(Self {
      auth,
      chain: options.chain(),
      client,
      database,
      first_dune_height: options.first_dune_height(),
      height_limit: options.height_limit,
      nr_parallel_requests: options.nr_parallel_requests(),
      rpc_url,
    })
  }

  pub fn update(&self) -> Result {
    Updater::update(self)
  }

  pub(crate) fn begin_read(&self) -> Result<Rtx> {
    Ok(Rtx(self.database.begin_read()?))
  }

  fn begin_write(&self) -> Result<WriteTransaction> {
    Ok(self.database.begin_write()?)
  }

  pub fn block_height(&self) -> Result<Option<u32>> {
    Ok(self.begin_read()?.height()?.map(|height| height.n()))
  }

  pub(crate) fn block_count(&self) -> Result<u32> {
    self.begin_read()?.block_count()
  }

  pub(crate) fn block_hash(&self, height: Option<u32>) -> Result<Option<BlockHash>> {
    self.begin_read()?.block_hash(height)
  }

  pub(crate) fn transaction_hash(&self, id: u64) -> Result<Option<Txid>> {
    Ok(
      self
        .database
        .begin_read()?
        .open_table(ID_TO_TRANSACTION_HASH)?
        .get(&id)?
        .map(|hash| Txid::load(*hash.value())),
    )
  }

  pub(crate) fn address(&self, id: u64) -> Result<Option<String>> {
    Ok(
      self
        .database
        .begin_read()?
        .open_table(ID_TO_ADDRESS)?
        .get(&id)?
        .map(|address| address.value().to_string()),
    )
  }

  /// Balances held by a utxo, in protocol-id order. `Ok(None)` means the
  /// outpoint was never indexed as holding dunes.
  pub fn utxo_dune_balances(
    &self,
    outpoint: OutPoint,
  ) -> Result<Option<(UtxoEntry, Vec<(DuneId, u128)>)>> {
    let rtx = self.database.begin_read()?;

    let Some(transaction_id) = rtx
      .open_table(TRANSACTION_HASH_TO_ID)?
      .get(&outpoint.txid.store())?
      .map(|id| id.value())
    else {
      return Ok(None);
    };

    let Some(utxo) = rtx
      .open_table(TRANSACTION_OUT_TO_UTXO)?
      .get(&(transaction_id, outpoint.vout))?
      .map(|value| UtxoEntry::load(value.value()))
    else {
      return Ok(None);
    };

    let balances = rtx
      .open_table(UTXO_ID_TO_DUNE_BALANCES)?
      .get(&utxo.id)?
      .map(|buffer| decode_dune_balances(buffer.value()))
      .unwrap_or_default();

    Ok(Some((utxo, balances)))
  }

  /// Aggregate balances for an address, in protocol-id order. Zero rows are
  /// retained in the store but filtered from the projection.
  pub fn address_dune_balances(&self, address: &str) -> Result<Vec<(DuneId, u128)>> {
    let rtx = self.database.begin_read()?;

    let Some(address_id) = rtx
      .open_table(ADDRESS_TO_ID)?
      .get(address)?
      .map(|id| id.value())
    else {
      return Ok(Vec::new());
    };

    let mut balances = Vec::new();

    for result in rtx
      .open_table(ADDRESS_DUNE_TO_BALANCE)?
      .range((address_id, (0, 0))..=(address_id, (u32::MAX, u32::MAX)))?
    {
      let (key, value) = result?;
      let balance = u128::load(value.value());
      if balance > 0 {
        balances.push((DuneId::load(key.value().1), balance));
      }
    }

    Ok(balances)
  }

  /// Reconstructs holdings at block `end` by scanning utxos created within
  /// `[start, end]` that were still unspent at `end`.
  pub fn snapshot_dune_balances(
    &self,
    address: &str,
    start: u32,
    end: u32,
  ) -> Result<Vec<(DuneId, u128)>> {
    let rtx = self.database.begin_read()?;

    let Some(address_id) = rtx
      .open_table(ADDRESS_TO_ID)?
      .get(address)?
      .map(|id| id.value())
    else {
      return Ok(Vec::new());
    };

    let utxo_id_to_dune_balances = rtx.open_table(UTXO_ID_TO_DUNE_BALANCES)?;

    let mut balances: BTreeMap<DuneId, u128> = BTreeMap::new();

    for result in rtx.open_table(TRANSACTION_OUT_TO_UTXO)?.iter()? {
      let (_key, value) = result?;
      let utxo = UtxoEntry::load(value.value());

      if utxo.address_id != address_id
        || utxo.block_created < start
        || utxo.block_created > end
        || utxo.block_spent.map(|spent| spent <= end).unwrap_or(false)
      {
        continue;
      }

      if let Some(buffer) = utxo_id_to_dune_balances.get(&utxo.id)? {
        for (id, balance) in decode_dune_balances(buffer.value()) {
          *balances.entry(id).or_default() += balance;
        }
      }
    }

    Ok(balances.into_iter().collect())
  }

  pub(crate) fn dune(&self, id: DuneId) -> Result<Option<DuneEntry>> {
    Ok(
      self
        .database
        .begin_read()?
        .open_table(DUNE_ID_TO_DUNE_ENTRY)?
        .get(&id.store())?
        .map(|entry| bincode::deserialize(entry.value()))
        .transpose()?,
    )
  }

  pub(crate) fn dunes(&self) -> Result<Vec<(DuneId, DuneEntry)>> {
    let mut dunes = Vec::new();

    for result in self
      .database
      .begin_read()?
      .open_table(DUNE_ID_TO_DUNE_ENTRY)?
      .iter()?
    {
      let (id, entry) = result?;
      dunes.push((DuneId::load(id.value()), bincode::deserialize(entry.value())?));
    }

    Ok(dunes)
  }

  /// All non-zero address balances, keyed by address string.
  pub(crate) fn dune_balances(&self) -> Result<BTreeMap<String, Vec<(DuneId, u128)>>> {
    let rtx = self.database.begin_read()?;

    let id_to_address = rtx.open_table(ID_TO_ADDRESS)?;

    let mut balances: BTreeMap<String, Vec<(DuneId, u128)>> = BTreeMap::new();

    for result in rtx.open_table(ADDRESS_DUNE_TO_BALANCE)?.iter()? {
      let (key, value) = result?;
      let (address_id, dune_id) = key.value();

      let balance = u128::load(value.value());
      if balance == 0 {
        continue;
      }

      let address = id_to_address
        .get(&address_id)?
        .map(|address| address.value().to_string())
        .ok_or_else(|| anyhow!("no address row for id {address_id}"))?;

      balances
        .entry(address)
        .or_default()
        .push((DuneId::load(dune_id), balance));
    }

    Ok(balances)
  }

  pub(crate) fn events(&self) -> Result<Vec<Event>> {
    let mut events = Vec::new();

    for result in self
      .database
      .begin_read()?
      .open_table(EVENT_ID_TO_EVENT)?
      .iter()?
    {
      let (_id, event) = result?;
      events.push(bincode::deserialize(event.value())?);
    }

    Ok(events)
  }
}

pub(crate) fn decode_dune_balances(buffer: &[u8]) -> Vec<(DuneId, u128)> {
  let mut balances = Vec::new();
  let mut i = 0;

  while i < buffer.len() {
    let (id, length) = dunes::varint::decode(&buffer[i..]);
    i += length;
    let (balance, length) = dunes::varint::decode(&buffer[i..]);
    i += length;
    balances.push((
      DuneId {
        block: u32::try_from(id >> 32).unwrap_or(u32::MAX),
        tx: u32::try_from(id & u128::from(u32::MAX)).unwrap_or(u32::MAX),
      },
      balance,
    ));
  }

  balances
}

pub(crate) fn encode_dune_balances(balances: &[(DuneId, u128)], buffer: &mut Vec<u8>) {
  for (id, balance) in balances {
    dunes::varint::encode_to_vec(
      u128::from(id.block) << 32 | u128::from(id.tx),
      buffer,
    );
    dunes::varint::encode_to_vec(*balance, buffer);
  }
}
