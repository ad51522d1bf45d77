use super::*;

pub(crate) struct Rtx<'a>(pub(crate) redb::ReadTransaction<'a>);

impl Rtx<'_> {
  pub(crate) fn height(&self) -> Result<Option<Height>> {
    Ok(
      self
        .0
        .open_table(HEIGHT_TO_BLOCK_HASH)?
        .range(0..)?
        .next_back()
        .map(|result| result.map(|(height, _hash)| Height(height.value())))
        .transpose()?,
    )
  }

  pub(crate) fn block_count(&self) -> Result<u32> {
    Ok(
      self
        .0
        .open_table(HEIGHT_TO_BLOCK_HASH)?
        .range(0..)?
        .next_back()
        .map(|result| result.map(|(height, _hash)| height.value() + 1))
        .transpose()?
        .unwrap_or(0),
    )
  }

  pub(crate) fn block_hash(&self, height: Option<u32>) -> Result<Option<BlockHash>> {
    let height_to_block_hash = self.0.open_table(HEIGHT_TO_BLOCK_HASH)?;

    Ok(match height {
      Some(height) => height_to_block_hash
        .get(height)?
        .map(|hash| BlockHash::load(*hash.value())),
      None => height_to_block_hash
        .range(0..)?
        .next_back()
        .transpose()?
        .map(|(_height, hash)| BlockHash::load(*hash.value())),
    })
  }
}
