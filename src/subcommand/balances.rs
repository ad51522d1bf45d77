use super::*;

#[derive(Serialize, Deserialize)]
pub struct Output {
  pub balances: BTreeMap<String, BTreeMap<String, String>>,
}

pub(crate) fn run(options: Options) -> SubcommandResult {
  let index = Index::open(&options)?;

  index.update()?;

  Ok(Box::new(Output {
    balances: index
      .dune_balances()?
      .into_iter()
      .map(|(address, balances)| {
        (
          address,
          balances
            .into_iter()
            .map(|(id, balance)| (id.to_string(), balance.to_string()))
            .collect(),
        )
      })
      .collect(),
  }))
}
