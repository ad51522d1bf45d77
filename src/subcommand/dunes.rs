use super::*;

#[derive(Serialize, Deserialize)]
pub struct DuneJson {
  pub dune: String,
  pub divisibility: u8,
  pub symbol: Option<char>,
  pub premine: String,
  pub mints: String,
  pub burned: String,
  pub turbo: bool,
  pub unmintable: bool,
}

#[derive(Serialize, Deserialize)]
pub struct Output {
  pub dunes: BTreeMap<String, DuneJson>,
}

pub(crate) fn run(options: Options) -> SubcommandResult {
  let index = Index::open(&options)?;

  index.update()?;

  Ok(Box::new(Output {
    dunes: index
      .dunes()?
      .into_iter()
      .map(|(id, entry)| {
        (
          id.to_string(),
          DuneJson {
            dune: entry.dune.to_string(),
            divisibility: entry.divisibility,
            symbol: entry.symbol,
            premine: entry.premine.to_string(),
            mints: entry.mints.to_string(),
            burned: entry.burned.to_string(),
            turbo: entry.turbo,
            unmintable: entry.unmintable,
          },
        )
      })
      .collect(),
  }))
}
