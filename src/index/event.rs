use super::*;

#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
  Etch = 0,
  Mint = 1,
  Transfer = 2,
  Burn = 3,
}

/// Append-only audit row. Within a transaction events are recorded in the
/// order ETCH, MINT, TRANSFER, BURN so replays are deterministic.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Event {
  pub kind: EventKind,
  pub block: u32,
  pub transaction_id: u64,
  pub dune_id: DuneId,
  pub amount: u128,
  pub from_address_id: u64,
  pub to_address_id: u64,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bincode_round_trip() {
    let event = Event {
      kind: EventKind::Transfer,
      block: 840_000,
      transaction_id: 3,
      dune_id: DuneId { block: 840_000, tx: 1 },
      amount: u128::MAX,
      from_address_id: 4,
      to_address_id: 5,
    };

    let serialized = bincode::serialize(&event).unwrap();
    assert_eq!(bincode::deserialize::<Event>(&serialized).unwrap(), event);
  }

  #[test]
  fn kind_serializes_by_name() {
    assert_eq!(
      serde_json::to_string(&EventKind::Etch).unwrap(),
      "\"ETCH\""
    );
  }
}
