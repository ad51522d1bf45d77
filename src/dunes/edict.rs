use super::*;

#[derive(Default, Serialize, Debug, PartialEq, Copy, Clone)]
pub struct Edict {
  pub id: DuneId,
  pub amount: u128,
  pub output: u32,
}

impl Edict {
  /// Validates a payload edict. `None` marks the dunestone a cenotaph: an id
  /// in the `0:t` form with `t > 0`, an unparseable amount, or an output
  /// index beyond the transaction's output count (equality is allowed and
  /// selects the spread-across-outputs form).
  pub(crate) fn from_payload(
    id: &str,
    amount: &str,
    output: u32,
    output_count: usize,
  ) -> Option<Self> {
    let id = id.parse::<DuneId>().ok()?;

    if id.block == 0 && id.tx > 0 {
      return None;
    }

    let amount = parse_amount(amount).ok()?;

    if u64::from(output) > u64::try_from(output_count).ok()? {
      return None;
    }

    Some(Self { id, amount, output })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn valid_edicts() {
    assert_eq!(
      Edict::from_payload("840000:1", "100", 0, 2).unwrap(),
      Edict {
        id: DuneId {
          block: 840000,
          tx: 1
        },
        amount: 100,
        output: 0,
      }
    );

    // output == output count selects the spread form
    assert!(Edict::from_payload("0:0", "0", 2, 2).is_some());
  }

  #[test]
  fn zero_block_with_nonzero_tx_is_invalid() {
    assert!(Edict::from_payload("0:1", "100", 0, 2).is_none());
    assert!(Edict::from_payload("0:0", "100", 0, 2).is_some());
  }

  #[test]
  fn out_of_range_output_is_invalid() {
    assert!(Edict::from_payload("1:1", "100", 3, 2).is_none());
  }

  #[test]
  fn malformed_id_or_amount_is_invalid() {
    assert!(Edict::from_payload("1", "100", 0, 2).is_none());
    assert!(Edict::from_payload("1:1", "1.0", 0, 2).is_none());
    assert!(Edict::from_payload(
      "1:1",
      "340282366920938463463374607431768211456",
      0,
      2
    )
    .is_none());
  }
}
