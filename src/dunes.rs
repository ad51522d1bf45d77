use super::*;

pub use {
  dune::Dune, dune_id::DuneId, dunestone::Dunestone, edict::Edict, etching::Etching,
  terms::{Price, Terms},
};

pub const MAX_DIVISIBILITY: u8 = 18;
pub const MAX_NAME_LENGTH: usize = 31;

/// Names at or above this value can only be assigned by the indexer itself.
pub(crate) const RESERVED: u128 = 6402364363415443603228541259936211926;

/// Minimum name length at the first dune height; one more character unlocks
/// every `UNLOCK_INTERVAL` blocks.
pub(crate) const INITIAL_AVAILABLE: u32 = 13;
pub(crate) const UNLOCK_INTERVAL: u32 = 17_500;

pub(crate) const COMMIT_CONFIRMATIONS: u32 = 6;
pub(crate) const TAPROOT_ANNEX_PREFIX: u8 = 0x50;
pub(crate) const TAPROOT_SCRIPT_PUBKEY_TYPE: &str = "witness_v1_taproot";

pub(crate) const PROTOCOL_IDENTIFIERS: [&str; 2] = ["dunes", "https://dunes.sh"];

pub(crate) const GENESIS_DUNE_NAME: &str = "DUNESGENESISDUNE";
pub(crate) const GENESIS_DUNE_SYMBOL: char = '◉';
pub(crate) const GENESIS_MINT_WINDOW: u32 = 210_000;

mod dune;
mod dune_id;
mod dunestone;
mod edict;
mod etching;
mod terms;
pub mod varint;

/// Parses an amount-bearing payload string as an integer in `[0, 2^128)`.
pub(crate) fn parse_amount(s: &str) -> Result<u128> {
  ensure!(
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()),
    "invalid amount: `{s}`"
  );
  s.parse()
    .with_context(|| format!("amount out of range: `{s}`"))
}

/// The synthetic etching applied to the coinbase of the first dune block.
pub(crate) fn genesis_etching(first_dune_height: u32) -> Etching {
  Etching {
    divisibility: Some(0),
    premine: None,
    dune: Some(GENESIS_DUNE_NAME.parse().unwrap()),
    symbol: Some(GENESIS_DUNE_SYMBOL),
    terms: Some(Terms {
      amount: 1,
      cap: Some(u128::MAX),
      height: (
        Some(first_dune_height),
        Some(first_dune_height + GENESIS_MINT_WINDOW),
      ),
      offset: (None, None),
      price: None,
    }),
    turbo: true,
  }
}

#[derive(Debug, PartialEq)]
pub enum MintError {
  Cap(u128),
  End(u32),
  Start(u32),
  SelfMint,
  Unmintable,
}

impl Display for MintError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      MintError::Cap(cap) => write!(f, "limited to {cap} mints"),
      MintError::End(end) => write!(f, "mint ended on block {end}"),
      MintError::Start(start) => write!(f, "mint starts on block {start}"),
      MintError::SelfMint => write!(f, "dune cannot be minted in its etching transaction"),
      MintError::Unmintable => write!(f, "not mintable"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_amount_accepts_full_u128_range() {
    assert_eq!(parse_amount("0").unwrap(), 0);
    assert_eq!(
      parse_amount("340282366920938463463374607431768211455").unwrap(),
      u128::MAX
    );
  }

  #[test]
  fn parse_amount_rejects_junk() {
    assert!(parse_amount("").is_err());
    assert!(parse_amount("-1").is_err());
    assert!(parse_amount("+1").is_err());
    assert!(parse_amount("1.5").is_err());
    assert!(parse_amount("1e3").is_err());
    assert!(parse_amount("340282366920938463463374607431768211456").is_err());
  }

  #[test]
  fn genesis_etching_satisfies_the_name_minimum() {
    let etching = genesis_etching(840_000);
    let dune = etching.dune.unwrap();
    assert!(dune.length() >= usize::try_from(INITIAL_AVAILABLE).unwrap());
    assert_eq!(etching.terms.unwrap().cap, Some(u128::MAX));
  }
}
