use super::*;

pub(crate) trait Entry: Sized {
  type Value;

  fn load(value: Self::Value) -> Self;

  fn store(self) -> Self::Value;
}

pub(super) type BlockHashValue = [u8; 32];

impl Entry for BlockHash {
  type Value = BlockHashValue;

  fn load(value: Self::Value) -> Self {
    BlockHash::from_inner(value)
  }

  fn store(self) -> Self::Value {
    self.into_inner()
  }
}

pub(crate) type TxidValue = [u8; 32];

impl Entry for Txid {
  type Value = TxidValue;

  fn load(value: Self::Value) -> Self {
    Txid::from_inner(value)
  }

  fn store(self) -> Self::Value {
    self.into_inner()
  }
}

pub(super) type DuneIdValue = (u32, u32);

impl Entry for DuneId {
  type Value = DuneIdValue;

  fn load((block, tx): Self::Value) -> Self {
    Self { block, tx }
  }

  fn store(self) -> Self::Value {
    (self.block, self.tx)
  }
}

/// Balances are persisted as two signed 64-bit halves, low word first. The
/// halves are reinterpreted bit-for-bit on load, so the full unsigned 128-bit
/// range survives the round trip.
pub(super) type BalanceValue = (i64, i64);

#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
impl Entry for u128 {
  type Value = BalanceValue;

  fn load((low, high): Self::Value) -> Self {
    u128::from(low as u64) | u128::from(high as u64) << 64
  }

  fn store(self) -> Self::Value {
    (self as u64 as i64, (self >> 64) as u64 as i64)
  }
}

#[derive(Debug, PartialEq, Copy, Clone)]
pub(crate) struct UtxoEntry {
  pub(crate) id: u64,
  pub(crate) address_id: u64,
  pub(crate) value: u64,
  pub(crate) block_created: u32,
  pub(crate) block_spent: Option<u32>,
  pub(crate) transaction_spent_id: Option<u64>,
}

pub(super) type UtxoEntryValue = (u64, u64, u64, u32, Option<u32>, Option<u64>);

impl Entry for UtxoEntry {
  type Value = UtxoEntryValue;

  fn load(
    (id, address_id, value, block_created, block_spent, transaction_spent_id): UtxoEntryValue,
  ) -> Self {
    Self {
      id,
      address_id,
      value,
      block_created,
      block_spent,
      transaction_spent_id,
    }
  }

  fn store(self) -> Self::Value {
    (
      self.id,
      self.address_id,
      self.value,
      self.block_created,
      self.block_spent,
      self.transaction_spent_id,
    )
  }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub(crate) struct DuneEntry {
  pub(crate) burned: u128,
  pub(crate) deployer_address_id: u64,
  pub(crate) divisibility: u8,
  pub(crate) dune: Dune,
  pub(crate) etching_transaction_id: u64,
  pub(crate) mints: u128,
  pub(crate) number: u64,
  pub(crate) premine: u128,
  pub(crate) symbol: Option<char>,
  pub(crate) terms: Option<Terms>,
  pub(crate) turbo: bool,
  pub(crate) unmintable: bool,
}

impl DuneEntry {
  /// Whether a mint at `(height, tx_index)` would be accepted, counting the
  /// prospective mint against the cap. `id` is the dune's own protocol id,
  /// whose block is the creation height used for offset windows.
  pub(crate) fn mintable(&self, id: DuneId, height: u32, tx_index: u32) -> Result<(), MintError> {
    if self.unmintable {
      return Err(MintError::Unmintable);
    }

    if id.block == height && id.tx == tx_index {
      return Err(MintError::SelfMint);
    }

    let Some(terms) = &self.terms else {
      return Err(MintError::Unmintable);
    };

    if !terms.is_flex() {
      if let Some(cap) = terms.cap {
        if self.mints.checked_add(1).map_or(true, |total| total > cap) {
          return Err(MintError::Cap(cap));
        }
      }
    }

    if let Some(start) = self.start(id) {
      if height < start {
        return Err(MintError::Start(start));
      }
    }

    if let Some(end) = self.end(id) {
      if height > end {
        return Err(MintError::End(end));
      }
    }

    Ok(())
  }

  /// Effective mint start: the later of the absolute height and the
  /// creation-relative offset, when both are present.
  pub(crate) fn start(&self, id: DuneId) -> Option<u32> {
    let terms = self.terms.as_ref()?;

    let relative = terms
      .offset
      .0
      .map(|offset| id.block.saturating_add(offset));

    let absolute = terms.height.0;

    relative
      .zip(absolute)
      .map(|(relative, absolute)| relative.max(absolute))
      .or(relative)
      .or(absolute)
  }

  /// Effective mint end: the earlier of the two bounds.
  pub(crate) fn end(&self, id: DuneId) -> Option<u32> {
    let terms = self.terms.as_ref()?;

    let relative = terms
      .offset
      .1
      .map(|offset| id.block.saturating_add(offset));

    let absolute = terms.height.1;

    relative
      .zip(absolute)
      .map(|(relative, absolute)| relative.min(absolute))
      .or(relative)
      .or(absolute)
  }
}

impl Default for DuneEntry {
  fn default() -> Self {
    Self {
      burned: 0,
      deployer_address_id: 0,
      divisibility: 0,
      dune: Dune(0),
      etching_transaction_id: 0,
      mints: 0,
      number: 0,
      premine: 0,
      symbol: None,
      terms: None,
      turbo: false,
      unmintable: false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn balance_halves_round_trip() {
    #[track_caller]
    fn case(n: u128) {
      assert_eq!(u128::load(n.store()), n);
    }

    case(0);
    case(1);
    case(u128::from(u64::MAX));
    case(u128::from(u64::MAX) + 1);
    case(u128::MAX);
    case(u128::MAX - 1);
    case(1 << 63);
    case(1 << 64);
    case(1 << 127);

    for i in 0..128 {
      case(1 << i);
      case((1 << i) - 1);
      case(u128::MAX >> i);
    }
  }

  #[test]
  fn negative_halves_reinterpret_as_high_bits() {
    // the full-range balance has both halves negative on disk
    assert_eq!(u128::MAX.store(), (-1i64, -1i64));
    assert_eq!(u128::load((-1, -1)), u128::MAX);
    assert_eq!((1u128 << 63).store(), (i64::MIN, 0));
  }

  #[test]
  fn utxo_entry_round_trip() {
    let entry = UtxoEntry {
      id: 7,
      address_id: 4,
      value: 10_000,
      block_created: 840_000,
      block_spent: Some(840_001),
      transaction_spent_id: Some(9),
    };

    assert_eq!(UtxoEntry::load(entry.store()), entry);
  }

  #[test]
  fn dune_entry_bincode_round_trip() {
    let entry = DuneEntry {
      burned: 10,
      deployer_address_id: 4,
      divisibility: 2,
      dune: "HELLO".parse().unwrap(),
      etching_transaction_id: 1,
      mints: 3,
      number: 0,
      premine: 1000,
      symbol: Some('¤'),
      terms: Some(Terms {
        amount: 10,
        cap: Some(100),
        height: (None, Some(900_000)),
        offset: (Some(10), None),
        price: Some(Price {
          amount: 1000,
          pay_to: "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".into(),
        }),
      }),
      turbo: true,
      unmintable: false,
    };

    let serialized = bincode::serialize(&entry).unwrap();
    assert_eq!(bincode::deserialize::<DuneEntry>(&serialized).unwrap(), entry);
  }

  #[test]
  fn mintable_enforces_the_cap() {
    let id = DuneId { block: 840_000, tx: 1 };

    let mut entry = DuneEntry {
      terms: Some(Terms {
        amount: 10,
        cap: Some(2),
        height: (None, None),
        offset: (None, None),
        price: None,
      }),
      ..Default::default()
    };

    assert_eq!(entry.mintable(id, 840_001, 0), Ok(()));

    entry.mints = 2;
    assert_eq!(entry.mintable(id, 840_001, 0), Err(MintError::Cap(2)));
  }

  #[test]
  fn mintable_rejects_the_etching_transaction() {
    let id = DuneId { block: 840_000, tx: 1 };

    let entry = DuneEntry {
      terms: Some(Terms {
        amount: 10,
        cap: None,
        height: (None, None),
        offset: (None, None),
        price: None,
      }),
      ..Default::default()
    };

    assert_eq!(entry.mintable(id, 840_000, 1), Err(MintError::SelfMint));
    assert_eq!(entry.mintable(id, 840_000, 2), Ok(()));
  }

  #[test]
  fn mint_window_takes_the_later_start_and_earlier_end() {
    let id = DuneId { block: 840_000, tx: 1 };

    let entry = DuneEntry {
      terms: Some(Terms {
        amount: 10,
        cap: None,
        height: (Some(840_010), Some(840_100)),
        offset: (Some(20), Some(50)),
        price: None,
      }),
      ..Default::default()
    };

    // offset start 840_020 > height start 840_010
    assert_eq!(entry.start(id), Some(840_020));
    // offset end 840_050 < height end 840_100
    assert_eq!(entry.end(id), Some(840_050));

    assert_eq!(
      entry.mintable(id, 840_019, 0),
      Err(MintError::Start(840_020))
    );
    assert_eq!(entry.mintable(id, 840_020, 0), Ok(()));
    assert_eq!(entry.mintable(id, 840_050, 0), Ok(()));
    assert_eq!(entry.mintable(id, 840_051, 0), Err(MintError::End(840_050)));
  }

  #[test]
  fn mint_window_defaults_to_the_provided_bound() {
    let id = DuneId { block: 840_000, tx: 1 };

    let entry = DuneEntry {
      terms: Some(Terms {
        amount: 10,
        cap: None,
        height: (None, Some(840_100)),
        offset: (Some(20), None),
        price: None,
      }),
      ..Default::default()
    };

    assert_eq!(entry.start(id), Some(840_020));
    assert_eq!(entry.end(id), Some(840_100));
  }

  #[test]
  fn unmintable_dunes_never_mint() {
    let id = DuneId { block: 840_000, tx: 1 };

    let entry = DuneEntry {
      unmintable: true,
      terms: Some(Terms {
        amount: 10,
        ..Default::default()
      }),
      ..Default::default()
    };

    assert_eq!(entry.mintable(id, 840_001, 0), Err(MintError::Unmintable));
  }

  #[test]
  fn flex_dunes_ignore_the_cap() {
    let id = DuneId { block: 840_000, tx: 1 };

    let entry = DuneEntry {
      mints: 1_000_000,
      terms: Some(Terms {
        amount: 0,
        cap: None,
        height: (None, None),
        offset: (None, None),
        price: Some(Price {
          amount: 1000,
          pay_to: "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".into(),
        }),
      }),
      ..Default::default()
    };

    assert_eq!(entry.mintable(id, 840_001, 0), Ok(()));
  }
}
