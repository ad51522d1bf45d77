use super::*;

#[derive(Default, Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Terms {
  /// Units credited per mint. Zero together with a price selects flex mode,
  /// where the minted amount is derived from satoshis paid.
  pub amount: u128,
  pub cap: Option<u128>,
  pub height: (Option<u32>, Option<u32>),
  pub offset: (Option<u32>, Option<u32>),
  pub price: Option<Price>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Price {
  /// Satoshis per minted unit.
  pub amount: u64,
  pub pay_to: String,
}

impl Terms {
  pub(crate) fn is_flex(&self) -> bool {
    self.amount == 0 && self.price.is_some()
  }
}
