use {
  self::error::{ServerError, ServerResult},
  super::*,
  axum::{
    extract::{Extension, Json, Path},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
  },
  axum_server::Handle,
  tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
  },
};

mod error;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct DuneBalanceJson {
  pub dune: String,
  pub amount: String,
  pub divisibility: u8,
  pub symbol: Option<char>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct DuneDetailJson {
  pub dune: String,
  pub dune_protocol_id: String,
  pub divisibility: u8,
  pub symbol: Option<char>,
  pub premine: String,
  pub mints: String,
  pub burned: String,
  pub turbo: bool,
  pub unmintable: bool,
  pub etching_transaction: Option<String>,
  pub deployer_address: Option<String>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockHeightJson {
  pub height: Option<u32>,
}

#[derive(Debug, Parser)]
pub(crate) struct Server {
  #[arg(
    long,
    default_value = "0.0.0.0",
    help = "Listen on <ADDRESS> for incoming requests."
  )]
  address: String,
  #[arg(
    long,
    default_value = "8080",
    help = "Listen on <HTTP_PORT> for incoming HTTP requests."
  )]
  http_port: u16,
}

impl Server {
  pub(crate) fn run(self, options: Options, index: Arc<Index>, handle: Handle) -> SubcommandResult {
    Runtime::new()?.block_on(async {
      let index_clone = index.clone();

      let index_thread = thread::spawn(move || loop {
        if SHUTTING_DOWN.load(atomic::Ordering::Relaxed) {
          break;
        }
        if let Err(error) = index_clone.update() {
          log::warn!("{error}");
        }
        thread::sleep(Duration::from_millis(5000));
      });
      INDEXER.lock().unwrap().replace(index_thread);

      let router = Router::new()
        .route("/block-height", get(Self::block_height))
        .route("/utxo/:outpoint", get(Self::utxo))
        .route("/utxo/:outpoint/:dune", get(Self::utxo_dune))
        .route("/address/:address", get(Self::address))
        .route("/address/:address/:dune", get(Self::address_dune))
        .route("/dune/:dune", get(Self::dune))
        .route("/snapshot/:start/:end/address/:address", get(Self::snapshot))
        .route(
          "/snapshot/:start/:end/address/:address/:dune",
          get(Self::snapshot_dune),
        )
        .layer(Extension(index))
        .layer(Extension(options.chain()))
        .layer(CompressionLayer::new())
        .layer(
          CorsLayer::new()
            .allow_methods([Method::GET])
            .allow_origin(Any),
        );

      let addr = (self.address.as_str(), self.http_port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow!("failed to get socket addrs"))?;

      log::info!("Listening on http://{addr}");

      axum_server::Server::bind(addr)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;

      Ok(Box::new(Empty {}) as Box<dyn Output>)
    })
  }

  async fn block_height(
    Extension(index): Extension<Arc<Index>>,
  ) -> ServerResult<Json<BlockHeightJson>> {
    Ok(Json(BlockHeightJson {
      height: index.block_height().map_err(ServerError::Internal)?,
    }))
  }

  async fn utxo(
    Extension(index): Extension<Arc<Index>>,
    Path(outpoint): Path<String>,
  ) -> ServerResult<Json<BTreeMap<String, DuneBalanceJson>>> {
    let outpoint = parse_outpoint(&outpoint)?;

    let balances = index
      .utxo_dune_balances(outpoint)
      .map_err(ServerError::Internal)?
      .map(|(_, balances)| balances)
      .unwrap_or_default();

    Ok(Json(balances_json(&index, balances)?))
  }

  async fn utxo_dune(
    Extension(index): Extension<Arc<Index>>,
    Path((outpoint, dune)): Path<(String, String)>,
  ) -> ServerResult<Json<BTreeMap<String, DuneBalanceJson>>> {
    let outpoint = parse_outpoint(&outpoint)?;
    let dune = parse_dune_id(&dune)?;

    let balances = index
      .utxo_dune_balances(outpoint)
      .map_err(ServerError::Internal)?
      .map(|(_, balances)| balances)
      .unwrap_or_default()
      .into_iter()
      .filter(|(id, _)| *id == dune)
      .collect();

    Ok(Json(balances_json(&index, balances)?))
  }

  async fn address(
    Extension(index): Extension<Arc<Index>>,
    Extension(chain): Extension<Chain>,
    Path(address): Path<String>,
  ) -> ServerResult<Json<BTreeMap<String, DuneBalanceJson>>> {
    let address = parse_address(&address, chain)?;

    let balances = index
      .address_dune_balances(&address)
      .map_err(ServerError::Internal)?;

    Ok(Json(balances_json(&index, balances)?))
  }

  async fn address_dune(
    Extension(index): Extension<Arc<Index>>,
    Extension(chain): Extension<Chain>,
    Path((address, dune)): Path<(String, String)>,
  ) -> ServerResult<Json<BTreeMap<String, DuneBalanceJson>>> {
    let address = parse_address(&address, chain)?;
    let dune = parse_dune_id(&dune)?;

    let balances = index
      .address_dune_balances(&address)
      .map_err(ServerError::Internal)?
      .into_iter()
      .filter(|(id, _)| *id == dune)
      .collect();

    Ok(Json(balances_json(&index, balances)?))
  }

  async fn dune(
    Extension(index): Extension<Arc<Index>>,
    Path(dune): Path<String>,
  ) -> ServerResult<Json<DuneDetailJson>> {
    let id = parse_dune_id(&dune)?;

    let entry = index
      .dune(id)
      .map_err(ServerError::Internal)?
      .ok_or_else(|| ServerError::NotFound(format!("dune {id} not found")))?;

    Ok(Json(DuneDetailJson {
      dune: entry.dune.to_string(),
      dune_protocol_id: id.to_string(),
      divisibility: entry.divisibility,
      symbol: entry.symbol,
      premine: entry.premine.to_string(),
      mints: entry.mints.to_string(),
      burned: entry.burned.to_string(),
      turbo: entry.turbo,
      unmintable: entry.unmintable,
      etching_transaction: index
        .transaction_hash(entry.etching_transaction_id)
        .map_err(ServerError::Internal)?
        .map(|txid| txid.to_string()),
      deployer_address: index
        .address(entry.deployer_address_id)
        .map_err(ServerError::Internal)?,
    }))
  }

  async fn snapshot(
    Extension(index): Extension<Arc<Index>>,
    Extension(chain): Extension<Chain>,
    Path((start, end, address)): Path<(String, String, String)>,
  ) -> ServerResult<Json<BTreeMap<String, DuneBalanceJson>>> {
    let (start, end) = parse_snapshot_range(&start, &end)?;
    let address = parse_address(&address, chain)?;

    let balances = index
      .snapshot_dune_balances(&address, start, end)
      .map_err(ServerError::Internal)?;

    Ok(Json(balances_json(&index, balances)?))
  }

  async fn snapshot_dune(
    Extension(index): Extension<Arc<Index>>,
    Extension(chain): Extension<Chain>,
    Path((start, end, address, dune)): Path<(String, String, String, String)>,
  ) -> ServerResult<Json<BTreeMap<String, DuneBalanceJson>>> {
    let (start, end) = parse_snapshot_range(&start, &end)?;
    let address = parse_address(&address, chain)?;
    let dune = parse_dune_id(&dune)?;

    let balances = index
      .snapshot_dune_balances(&address, start, end)
      .map_err(ServerError::Internal)?
      .into_iter()
      .filter(|(id, _)| *id == dune)
      .collect();

    Ok(Json(balances_json(&index, balances)?))
  }
}

fn parse_outpoint(outpoint: &str) -> ServerResult<OutPoint> {
  outpoint
    .parse()
    .map_err(|_| ServerError::BadRequest(format!("invalid outpoint: {outpoint}")))
}

fn parse_dune_id(dune: &str) -> ServerResult<DuneId> {
  dune
    .parse()
    .map_err(|_| ServerError::BadRequest(format!("invalid dune protocol id: {dune}")))
}

fn parse_address(address: &str, chain: Chain) -> ServerResult<String> {
  let parsed = address
    .parse::<Address>()
    .map_err(|_| ServerError::BadRequest(format!("invalid address: {address}")))?;

  if parsed.network != chain.network() {
    return Err(ServerError::BadRequest(format!(
      "address {address} is not a {chain} address"
    )));
  }

  Ok(parsed.to_string())
}

fn parse_snapshot_range(start: &str, end: &str) -> ServerResult<(u32, u32)> {
  let start = start
    .parse::<u32>()
    .map_err(|_| ServerError::BadRequest(format!("invalid start height: {start}")))?;

  let end = end
    .parse::<u32>()
    .map_err(|_| ServerError::BadRequest(format!("invalid end height: {end}")))?;

  if start > end {
    return Err(ServerError::BadRequest(format!(
      "start height {start} is after end height {end}"
    )));
  }

  Ok((start, end))
}

fn balances_json(
  index: &Index,
  balances: Vec<(DuneId, u128)>,
) -> ServerResult<BTreeMap<String, DuneBalanceJson>> {
  let mut json = BTreeMap::new();

  for (id, amount) in balances {
    let entry = index
      .dune(id)
      .map_err(ServerError::Internal)?
      .ok_or_else(|| ServerError::Internal(anyhow!("balance references unknown dune {id}")))?;

    json.insert(
      id.to_string(),
      DuneBalanceJson {
        dune: entry.dune.to_string(),
        amount: amount.to_string(),
        divisibility: entry.divisibility,
        symbol: entry.symbol,
      },
    );
  }

  Ok(json)
}
