use super::*;

#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
  pub(crate) rpc_url: Option<String>,
  pub(crate) cookie_file: Option<PathBuf>,
}
