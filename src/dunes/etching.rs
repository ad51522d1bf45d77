use super::*;

#[derive(Default, Serialize, Debug, PartialEq, Clone)]
pub struct Etching {
  pub divisibility: Option<u8>,
  pub premine: Option<u128>,
  pub dune: Option<Dune>,
  pub symbol: Option<char>,
  pub terms: Option<Terms>,
  pub turbo: bool,
}
