use super::*;

/// Block-scoped staging area. All reads the transition engine performs while
/// processing a block are served from this cache, which is populated by a
/// handful of bulk prefetches against the store and written back in a single
/// transaction at flush. Entities created mid-block receive tentative ids
/// from the persisted sequence counters; the ids become final at flush, which
/// is the only writer.
pub(crate) struct BlockCache {
  pub(crate) height: u32,
  hash: BlockHash,

  next_address_id: u64,
  next_transaction_id: u64,
  next_utxo_id: u64,
  next_event_id: u64,
  dunes: u64,

  addresses: HashMap<String, u64>,
  address_strings: HashMap<u64, String>,
  new_addresses: BTreeSet<u64>,

  transactions: HashMap<Txid, u64>,
  new_transactions: Vec<(Txid, u64)>,

  utxos: HashMap<(u64, u32), UtxoEntry>,
  dirty_utxos: BTreeSet<(u64, u32)>,
  utxo_balances: HashMap<u64, Vec<(DuneId, u128)>>,
  new_utxo_balances: BTreeSet<u64>,

  dunes_by_id: HashMap<DuneId, DuneEntry>,
  dune_ids_by_name: HashMap<u128, DuneId>,
  dirty_dunes: BTreeSet<DuneId>,

  balances: HashMap<(u64, DuneId), u128>,
  dirty_balances: BTreeSet<(u64, DuneId)>,

  events: Vec<Event>,
}

impl BlockCache {
  /// Prefetches everything the engine may read while processing `block`:
  /// input transactions, their utxos and balance lists, every address the
  /// block can touch, every dune the block references, and the aggregate
  /// balances of the prefetched addresses.
  pub(crate) fn load(
    index: &Index,
    height: u32,
    block: &Block,
    dunestones: &[Option<Dunestone>],
  ) -> Result<Self> {
    let rtx = index.database.begin_read()?;

    let statistics = rtx.open_table(STATISTIC_TO_COUNT)?;

    let statistic = |statistic: Statistic| -> Result<u64> {
      Ok(
        statistics
          .get(&statistic.key())?
          .map(|x| x.value())
          .unwrap_or_default(),
      )
    };

    let mut cache = Self {
      height,
      hash: block.block_hash(),
      next_address_id: statistic(Statistic::NextAddressId)?,
      next_transaction_id: statistic(Statistic::NextTransactionId)?,
      next_utxo_id: statistic(Statistic::NextUtxoId)?,
      next_event_id: statistic(Statistic::NextEventId)?,
      dunes: statistic(Statistic::Dunes)?,
      addresses: HashMap::new(),
      address_strings: HashMap::new(),
      new_addresses: BTreeSet::new(),
      transactions: HashMap::new(),
      new_transactions: Vec::new(),
      utxos: HashMap::new(),
      dirty_utxos: BTreeSet::new(),
      utxo_balances: HashMap::new(),
      new_utxo_balances: BTreeSet::new(),
      dunes_by_id: HashMap::new(),
      dune_ids_by_name: HashMap::new(),
      dirty_dunes: BTreeSet::new(),
      balances: HashMap::new(),
      dirty_balances: BTreeSet::new(),
      events: Vec::new(),
    };

    let transaction_hash_to_id = rtx.open_table(TRANSACTION_HASH_TO_ID)?;
    let transaction_out_to_utxo = rtx.open_table(TRANSACTION_OUT_TO_UTXO)?;
    let utxo_id_to_dune_balances = rtx.open_table(UTXO_ID_TO_DUNE_BALANCES)?;
    let address_to_id = rtx.open_table(ADDRESS_TO_ID)?;
    let id_to_address = rtx.open_table(ID_TO_ADDRESS)?;
    let dune_id_to_dune_entry = rtx.open_table(DUNE_ID_TO_DUNE_ENTRY)?;
    let dune_to_dune_id = rtx.open_table(DUNE_TO_DUNE_ID)?;
    let address_dune_to_balance = rtx.open_table(ADDRESS_DUNE_TO_BALANCE)?;

    // input transactions
    for tx in &block.txdata {
      for input in &tx.input {
        if input.previous_output.is_null() {
          continue;
        }

        let txid = input.previous_output.txid;
        if cache.transactions.contains_key(&txid) {
          continue;
        }

        if let Some(id) = transaction_hash_to_id.get(&txid.store())? {
          cache.transactions.insert(txid, id.value());
        }
      }
    }

    // input utxos and their balance lists
    for tx in &block.txdata {
      for input in &tx.input {
        if input.previous_output.is_null() {
          continue;
        }

        let Some(transaction_id) = cache.transactions.get(&input.previous_output.txid).copied()
        else {
          continue;
        };

        let key = (transaction_id, input.previous_output.vout);
        if cache.utxos.contains_key(&key) {
          continue;
        }

        if let Some(value) = transaction_out_to_utxo.get(&key)? {
          let utxo = UtxoEntry::load(value.value());

          if let Some(buffer) = utxo_id_to_dune_balances.get(&utxo.id)? {
            cache
              .utxo_balances
              .insert(utxo.id, decode_dune_balances(buffer.value()));
          }

          cache.utxos.insert(key, utxo);
        }
      }
    }

    // addresses: the reserved triple, input utxo owners, block recipients
    for (id, _) in RESERVED_ADDRESSES {
      if let Some(address) = id_to_address.get(&id)? {
        let address = address.value().to_string();
        cache.addresses.insert(address.clone(), id);
        cache.address_strings.insert(id, address);
      }
    }

    for utxo in cache.utxos.values() {
      if let Some(address) = id_to_address.get(&utxo.address_id)? {
        let address = address.value().to_string();
        cache.addresses.insert(address.clone(), utxo.address_id);
        cache.address_strings.insert(utxo.address_id, address);
      }
    }

    for tx in &block.txdata {
      for output in &tx.output {
        if output.script_pubkey.is_op_return() {
          continue;
        }

        let Ok(address) = index.chain.address_from_script(&output.script_pubkey) else {
          continue;
        };

        let address = address.to_string();
        if cache.addresses.contains_key(&address) {
          continue;
        }

        if let Some(id) = address_to_id.get(address.as_str())? {
          cache.address_strings.insert(id.value(), address.clone());
          cache.addresses.insert(address, id.value());
        }
      }
    }

    // dunes referenced by mints, edicts, balance lists and etching names
    let mut dune_ids = BTreeSet::new();

    for dunestone in dunestones.iter().flatten() {
      if let Some(mint) = dunestone.mint {
        dune_ids.insert(mint);
      }

      for edict in &dunestone.edicts {
        if !edict.id.is_self_reference() {
          dune_ids.insert(edict.id);
        }
      }

      if let Some(name) = dunestone.etching.as_ref().and_then(|etching| etching.dune) {
        if let Some(id) = dune_to_dune_id.get(&name.0)? {
          dune_ids.insert(DuneId::load(id.value()));
        }
      }
    }

    for balances in cache.utxo_balances.values() {
      for (id, _) in balances {
        dune_ids.insert(*id);
      }
    }

    for id in dune_ids {
      if let Some(bytes) = dune_id_to_dune_entry.get(&id.store())? {
        let entry: DuneEntry = bincode::deserialize(bytes.value())?;
        cache.dune_ids_by_name.insert(entry.dune.0, id);
        cache.dunes_by_id.insert(id, entry);
      }
    }

    // aggregate balances for every prefetched address
    for address_id in cache.address_strings.keys().copied().collect::<Vec<u64>>() {
      for result in
        address_dune_to_balance.range((address_id, (0, 0))..=(address_id, (u32::MAX, u32::MAX)))?
      {
        let (key, value) = result?;
        cache
          .balances
          .insert((address_id, DuneId::load(key.value().1)), u128::load(value.value()));
      }
    }

    Ok(cache)
  }

  pub(crate) fn address_id(&mut self, address: String) -> u64 {
    if let Some(id) = self.addresses.get(&address) {
      return *id;
    }

    let id = self.next_address_id;
    self.next_address_id += 1;
    self.addresses.insert(address.clone(), id);
    self.address_strings.insert(id, address);
    self.new_addresses.insert(id);
    id
  }

  pub(crate) fn existing_transaction_id(&self, txid: &Txid) -> Option<u64> {
    self.transactions.get(txid).copied()
  }

  pub(crate) fn transaction_id(&mut self, txid: Txid) -> u64 {
    if let Some(id) = self.transactions.get(&txid) {
      return *id;
    }

    let id = self.next_transaction_id;
    self.next_transaction_id += 1;
    self.transactions.insert(txid, id);
    self.new_transactions.push((txid, id));
    id
  }

  pub(crate) fn utxo(&self, key: &(u64, u32)) -> Option<&UtxoEntry> {
    self.utxos.get(key)
  }

  pub(crate) fn utxo_balances(&self, utxo_id: u64) -> Option<&Vec<(DuneId, u128)>> {
    self.utxo_balances.get(&utxo_id)
  }

  pub(crate) fn create_utxo(
    &mut self,
    key: (u64, u32),
    address_id: u64,
    value: u64,
    balances: Vec<(DuneId, u128)>,
  ) -> u64 {
    let id = self.next_utxo_id;
    self.next_utxo_id += 1;

    self.utxos.insert(
      key,
      UtxoEntry {
        id,
        address_id,
        value,
        block_created: self.height,
        block_spent: None,
        transaction_spent_id: None,
      },
    );
    self.dirty_utxos.insert(key);

    self.utxo_balances.insert(id, balances);
    self.new_utxo_balances.insert(id);

    id
  }

  pub(crate) fn spend_utxo(&mut self, key: (u64, u32), transaction_spent_id: u64) -> Result {
    let height = self.height;
    let utxo = self
      .utxos
      .get_mut(&key)
      .ok_or_else(|| anyhow!("spent utxo {key:?} is not in the block cache"))?;

    ensure!(utxo.block_spent.is_none(), "utxo {key:?} spent twice");

    utxo.block_spent = Some(height);
    utxo.transaction_spent_id = Some(transaction_spent_id);
    self.dirty_utxos.insert(key);

    Ok(())
  }

  pub(crate) fn dune(&self, id: DuneId) -> Option<&DuneEntry> {
    self.dunes_by_id.get(&id)
  }

  pub(crate) fn dune_mut(&mut self, id: DuneId) -> Option<&mut DuneEntry> {
    self.dirty_dunes.insert(id);
    self.dunes_by_id.get_mut(&id)
  }

  pub(crate) fn dune_id_by_name(&self, name: Dune) -> Option<DuneId> {
    self.dune_ids_by_name.get(&name.0).copied()
  }

  pub(crate) fn create_dune(&mut self, id: DuneId, mut entry: DuneEntry) {
    entry.number = self.dunes;
    self.dunes += 1;

    self.dune_ids_by_name.insert(entry.dune.0, id);
    self.dunes_by_id.insert(id, entry);
    self.dirty_dunes.insert(id);
  }

  pub(crate) fn add_balance(&mut self, address_id: u64, dune_id: DuneId, amount: u128) -> Result {
    let balance = self.balances.entry((address_id, dune_id)).or_default();
    *balance = balance
      .checked_add(amount)
      .ok_or_else(|| anyhow!("balance overflow for address {address_id} dune {dune_id}"))?;
    self.dirty_balances.insert((address_id, dune_id));
    Ok(())
  }

  pub(crate) fn sub_balance(&mut self, address_id: u64, dune_id: DuneId, amount: u128) -> Result {
    let balance = self.balances.entry((address_id, dune_id)).or_default();
    *balance = balance.checked_sub(amount).ok_or_else(|| {
      anyhow!("balance underflow for address {address_id} dune {dune_id}")
    })?;
    self.dirty_balances.insert((address_id, dune_id));
    Ok(())
  }

  pub(crate) fn record_event(&mut self, event: Event) {
    self.events.push(event);
  }

  /// Writes the block's staged state in one transaction, parents before
  /// children: addresses, dunes, transactions, utxos, utxo balances,
  /// aggregate balances, events, then the sequence counters and the block
  /// hash marking the height as indexed.
  pub(crate) fn flush(self, index: &Index) -> Result {
    let wtx = index.begin_write()?;

    {
      let mut address_to_id = wtx.open_table(ADDRESS_TO_ID)?;
      let mut id_to_address = wtx.open_table(ID_TO_ADDRESS)?;

      for id in &self.new_addresses {
        let address = self
          .address_strings
          .get(id)
          .ok_or_else(|| anyhow!("no string for new address id {id}"))?;
        address_to_id.insert(address.as_str(), id)?;
        id_to_address.insert(id, address.as_str())?;
      }

      let mut dune_id_to_dune_entry = wtx.open_table(DUNE_ID_TO_DUNE_ENTRY)?;
      let mut dune_to_dune_id = wtx.open_table(DUNE_TO_DUNE_ID)?;

      for id in &self.dirty_dunes {
        let entry = self
          .dunes_by_id
          .get(id)
          .ok_or_else(|| anyhow!("no entry for dirty dune {id}"))?;
        dune_id_to_dune_entry.insert(id.store(), bincode::serialize(entry)?.as_slice())?;
        dune_to_dune_id.insert(&entry.dune.0, id.store())?;
      }

      let mut transaction_hash_to_id = wtx.open_table(TRANSACTION_HASH_TO_ID)?;
      let mut id_to_transaction_hash = wtx.open_table(ID_TO_TRANSACTION_HASH)?;

      for (txid, id) in &self.new_transactions {
        transaction_hash_to_id.insert(&txid.store(), id)?;
        id_to_transaction_hash.insert(id, &txid.store())?;
      }

      let mut transaction_out_to_utxo = wtx.open_table(TRANSACTION_OUT_TO_UTXO)?;

      for key in &self.dirty_utxos {
        let utxo = self
          .utxos
          .get(key)
          .ok_or_else(|| anyhow!("no entry for dirty utxo {key:?}"))?;
        transaction_out_to_utxo.insert(key, utxo.store())?;
      }

      let mut utxo_id_to_dune_balances = wtx.open_table(UTXO_ID_TO_DUNE_BALANCES)?;
      let mut buffer = Vec::new();

      for id in &self.new_utxo_balances {
        let balances = self
          .utxo_balances
          .get(id)
          .ok_or_else(|| anyhow!("no balances for new utxo {id}"))?;

        if balances.is_empty() {
          continue;
        }

        buffer.clear();
        encode_dune_balances(balances, &mut buffer);
        utxo_id_to_dune_balances.insert(id, buffer.as_slice())?;
      }

      let mut address_dune_to_balance = wtx.open_table(ADDRESS_DUNE_TO_BALANCE)?;

      for (address_id, dune_id) in &self.dirty_balances {
        let balance = self
          .balances
          .get(&(*address_id, *dune_id))
          .copied()
          .unwrap_or_default();
        // zero rows are kept; balances may legitimately pass through zero
        address_dune_to_balance.insert((*address_id, dune_id.store()), balance.store())?;
      }

      let mut event_id_to_event = wtx.open_table(EVENT_ID_TO_EVENT)?;

      for (i, event) in self.events.iter().enumerate() {
        event_id_to_event.insert(
          &(self.next_event_id + i as u64),
          bincode::serialize(event)?.as_slice(),
        )?;
      }

      let mut statistics = wtx.open_table(STATISTIC_TO_COUNT)?;
      statistics.insert(&Statistic::NextAddressId.key(), &self.next_address_id)?;
      statistics.insert(&Statistic::NextTransactionId.key(), &self.next_transaction_id)?;
      statistics.insert(&Statistic::NextUtxoId.key(), &self.next_utxo_id)?;
      statistics.insert(
        &Statistic::NextEventId.key(),
        &(self.next_event_id + self.events.len() as u64),
      )?;
      statistics.insert(&Statistic::Dunes.key(), &self.dunes)?;

      let mut height_to_block_hash = wtx.open_table(HEIGHT_TO_BLOCK_HASH)?;
      height_to_block_hash.insert(&self.height, &self.hash.store())?;
    }

    wtx.commit()?;

    Ok(())
  }
}
