use super::*;

#[derive(Default, Debug, PartialEq, Copy, Clone, Hash, Eq, Ord, PartialOrd)]
pub struct DuneId {
  pub block: u32,
  pub tx: u32,
}

impl DuneId {
  /// Protocol id of the synthetic genesis dune.
  pub(crate) const GENESIS: Self = DuneId { block: 1, tx: 0 };

  pub(crate) fn new(block: u32, tx: u32) -> Self {
    Self { block, tx }
  }

  /// The `0:0` form, which edicts use to reference the dune etched by the
  /// transaction that carries them.
  pub(crate) fn is_self_reference(self) -> bool {
    self.block == 0 && self.tx == 0
  }
}

impl Display for DuneId {
  fn fmt(&self, f: &mut Formatter) -> fmt::Result {
    write!(f, "{}:{}", self.block, self.tx)
  }
}

impl FromStr for DuneId {
  type Err = crate::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (block, tx) = s
      .split_once(':')
      .ok_or_else(|| anyhow!("invalid dune ID: {s}"))?;

    Ok(Self {
      block: block.parse()?,
      tx: tx.parse()?,
    })
  }
}

impl Serialize for DuneId {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for DuneId {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    Ok(DeserializeFromStr::deserialize(deserializer)?.0)
  }
}
