use super::*;

pub mod balances;
pub mod dunes;
mod index;
mod server;

#[derive(Debug, Parser)]
pub(crate) enum Subcommand {
  #[command(about = "List all dune balances by address")]
  Balances,
  #[command(about = "List all dunes")]
  Dunes,
  #[command(about = "Update the index")]
  Index,
  #[command(about = "Run the query API server")]
  Server(server::Server),
}

impl Subcommand {
  pub(crate) fn run(self, options: Options) -> SubcommandResult {
    match self {
      Self::Balances => balances::run(options),
      Self::Dunes => dunes::run(options),
      Self::Index => index::run(options),
      Self::Server(server) => {
        let index = Arc::new(Index::open(&options)?);
        let handle = axum_server::Handle::new();
        LISTENERS.lock().unwrap().push(handle.clone());
        server.run(options, index, handle)
      }
    }
  }
}

#[derive(Serialize, Deserialize)]
pub struct Empty {}

pub(crate) trait Output: Send {
  fn print_json(&self);
}

impl<T> Output for T
where
  T: Serialize + Send,
{
  fn print_json(&self) {
    serde_json::to_writer_pretty(io::stdout(), self).ok();
    println!();
  }
}

pub(crate) type SubcommandResult = Result<Box<dyn Output>>;
