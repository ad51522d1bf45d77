use super::*;

#[derive(Debug, Parser)]
#[command(version, about = "◉ Dune indexer and balance explorer for bitcoin")]
pub(crate) struct Arguments {
  #[command(flatten)]
  pub(crate) options: Options,
  #[command(subcommand)]
  pub(crate) subcommand: Subcommand,
}

impl Arguments {
  pub(crate) fn run(self) -> Result {
    let output = self.subcommand.run(self.options)?;
    output.print_json();
    Ok(())
  }
}
