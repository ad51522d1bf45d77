use super::*;

#[derive(Clone, Default, Debug, Parser)]
#[command(group(
  ArgGroup::new("chains")
    .required(false)
    .args(&["chain_argument"]),
))]
pub(crate) struct Options {
  #[arg(long, help = "Load Bitcoin Core data dir from <BITCOIN_DATA_DIR>.")]
  pub(crate) bitcoin_data_dir: Option<PathBuf>,
  #[arg(
    long = "chain",
    value_enum,
    default_value = "mainnet",
    help = "Use <CHAIN>."
  )]
  pub(crate) chain_argument: Chain,
  #[arg(long, help = "Load configuration from <CONFIG>.")]
  pub(crate) config: Option<PathBuf>,
  #[arg(long, help = "Load Bitcoin Core RPC cookie file from <COOKIE_FILE>.")]
  pub(crate) cookie_file: Option<PathBuf>,
  #[arg(long, help = "Store index in <DATA_DIR>.")]
  pub(crate) data_dir: Option<PathBuf>,
  #[arg(long, help = "Set index cache to <DB_CACHE_SIZE> bytes.")]
  pub(crate) db_cache_size: Option<usize>,
  #[arg(
    long,
    help = "Don't index dunestones before <FIRST_DUNE_HEIGHT>. Overrides the chain default."
  )]
  pub(crate) first_dune_height: Option<u32>,
  #[arg(long, help = "Don't index blocks at or above <HEIGHT_LIMIT>.")]
  pub(crate) height_limit: Option<u32>,
  #[arg(long, help = "Use index at <INDEX>.")]
  pub(crate) index: Option<PathBuf>,
  #[arg(
    long,
    default_value = "8",
    help = "Keep at most <NR_PARALLEL_REQUESTS> RPC block requests in flight."
  )]
  pub(crate) nr_parallel_requests: usize,
  #[arg(long, help = "Connect to Bitcoin Core RPC at <RPC_URL>.")]
  pub(crate) rpc_url: Option<String>,
}

impl Options {
  pub(crate) fn chain(&self) -> Chain {
    self.chain_argument
  }

  pub(crate) fn first_dune_height(&self) -> u32 {
    self
      .first_dune_height
      .unwrap_or_else(|| self.chain().first_dune_height())
  }

  pub(crate) fn nr_parallel_requests(&self) -> usize {
    self.nr_parallel_requests.max(1)
  }

  pub(crate) fn rpc_url(&self) -> String {
    if let Some(rpc_url) = &self.rpc_url {
      return rpc_url.clone();
    }

    if let Ok(Some(rpc_url)) = self.load_config().map(|config| config.rpc_url) {
      return rpc_url;
    }

    format!("127.0.0.1:{}", self.chain().default_rpc_port())
  }

  pub(crate) fn cookie_file(&self) -> Result<PathBuf> {
    if let Some(cookie_file) = &self.cookie_file {
      return Ok(cookie_file.clone());
    }

    if let Ok(Some(cookie_file)) = self.load_config().map(|config| config.cookie_file) {
      return Ok(cookie_file);
    }

    let path = if let Some(bitcoin_data_dir) = &self.bitcoin_data_dir {
      bitcoin_data_dir.clone()
    } else if cfg!(target_os = "linux") {
      dirs::home_dir()
        .ok_or_else(|| anyhow!("failed to get home dir"))?
        .join(".bitcoin")
    } else {
      dirs::data_dir()
        .ok_or_else(|| anyhow!("failed to get data dir"))?
        .join("Bitcoin")
    };

    Ok(self.chain().join_with_data_dir(&path).join(".cookie"))
  }

  pub(crate) fn data_dir(&self) -> Result<PathBuf> {
    let base = match &self.data_dir {
      Some(base) => base.clone(),
      None => dirs::data_dir()
        .ok_or_else(|| anyhow!("failed to retrieve data dir"))?
        .join("duned"),
    };

    Ok(self.chain().join_with_data_dir(&base))
  }

  pub(crate) fn load_config(&self) -> Result<Config> {
    match &self.config {
      Some(path) => Ok(serde_yaml::from_reader(File::open(path)?)?),
      None => {
        let path = self.data_dir()?.join("duned.yaml");
        if path.exists() {
          Ok(serde_yaml::from_reader(File::open(path)?)?)
        } else {
          Ok(Config::default())
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(args: &[&str]) -> Options {
    Arguments::try_parse_from(
      ["duned"]
        .iter()
        .chain(args.iter())
        .chain(["index"].iter())
        .copied(),
    )
    .unwrap()
    .options
  }

  #[test]
  fn rpc_url_overrides_default_port() {
    assert_eq!(
      parse(&["--rpc-url", "127.0.0.1:1234"]).rpc_url(),
      "127.0.0.1:1234"
    );
    assert_eq!(parse(&[]).rpc_url(), "127.0.0.1:8332");
  }

  #[test]
  fn first_dune_height_defaults_to_chain() {
    assert_eq!(parse(&[]).first_dune_height(), 840_000);
    assert_eq!(parse(&["--chain", "regtest"]).first_dune_height(), 0);
    assert_eq!(
      parse(&["--first-dune-height", "100"]).first_dune_height(),
      100
    );
  }

  #[test]
  fn nr_parallel_requests_is_at_least_one() {
    assert_eq!(parse(&["--nr-parallel-requests", "0"]).nr_parallel_requests(), 1);
    assert_eq!(parse(&[]).nr_parallel_requests(), 8);
  }

  #[test]
  fn cookie_file_defaults_to_bitcoin_data_dir() {
    let cookie_file = parse(&["--bitcoin-data-dir", "/var/lib/bitcoind"])
      .cookie_file()
      .unwrap();
    assert_eq!(cookie_file, PathBuf::from("/var/lib/bitcoind/.cookie"));
  }
}
