use {
  self::dune_updater::DuneUpdater,
  indicatif::{ProgressBar, ProgressStyle},
  rayon::prelude::*,
  super::*,
};

mod dune_updater;

/// Bounded window of prefetched blocks between the reader thread and the
/// engine.
const MAX_BLOCK_CACHE_SIZE: usize = 32;

pub(crate) struct Updater<'index> {
  index: &'index Index,
  height: u32,
}

impl<'index> Updater<'index> {
  pub(crate) fn update(index: &Index) -> Result {
    let start = index.block_count()?;

    let mut updater = Updater {
      index,
      height: start,
    };

    updater.update_to_tip()
  }

  fn update_to_tip(&mut self) -> Result {
    let tip = u32::try_from(self.index.client.get_block_count()?)
      .context("block count exceeds u32")?;

    let end = match self.index.height_limit {
      Some(limit) if limit == 0 => return Ok(()),
      Some(limit) => tip.min(limit - 1),
      None => tip,
    };

    if self.height > end {
      return Ok(());
    }

    let progress_bar = if cfg!(test)
      || log::log_enabled!(log::Level::Info)
      || env::var_os("DUNED_DISABLE_PROGRESS_BAR")
        .map(|value| value.len() > 0)
        .unwrap_or(false)
    {
      None
    } else {
      let progress_bar = ProgressBar::new(end.into());
      progress_bar.set_position(self.height.into());
      progress_bar.set_style(
        ProgressStyle::with_template("[indexing blocks] {wide_bar} {pos}/{len}").unwrap(),
      );
      Some(progress_bar)
    };

    let rx = Self::fetch_blocks_from(self.index, self.height, end)?;

    let start = Instant::now();
    let mut indexed = 0;

    while self.height <= end {
      if SHUTTING_DOWN.load(atomic::Ordering::Relaxed) {
        break;
      }

      let block = rx
        .recv()
        .map_err(|_| anyhow!("block receiver disconnected at height {}", self.height))?;

      self.index_block(block)?;

      indexed += 1;

      if let Some(progress_bar) = &progress_bar {
        progress_bar.inc(1);
      }

      self.height += 1;
    }

    if let Some(progress_bar) = &progress_bar {
      progress_bar.finish_and_clear();
    }

    if indexed > 0 {
      log::info!(
        "Indexed {indexed} blocks in {}s, tip at height {}",
        start.elapsed().as_secs(),
        self.height.saturating_sub(1),
      );
    }

    Ok(())
  }

  /// Feeds blocks in height order through a bounded channel. Up to
  /// `nr_parallel_requests` RPC fetches run concurrently per chunk; the
  /// consumer blocks while the window is empty and the reader blocks while
  /// it is full.
  fn fetch_blocks_from(index: &Index, start: u32, end: u32) -> Result<mpsc::Receiver<Block>> {
    let (tx, rx) = mpsc::sync_channel(MAX_BLOCK_CACHE_SIZE);

    let rpc_url = index.rpc_url.clone();
    let auth = index.auth.clone();
    let chunk = u32::try_from(index.nr_parallel_requests).unwrap_or(1).max(1);

    thread::spawn(move || {
      let mut height = start;

      while height <= end {
        let heights = (height..=end.min(height + chunk - 1)).collect::<Vec<u32>>();

        let blocks = heights
          .par_iter()
          .map_init(
            || Client::new(&rpc_url, auth.clone()),
            |client, height| -> Result<Block> {
              let client = match client {
                Ok(client) => client,
                Err(err) => bail!("failed to connect to RPC URL: {err}"),
              };
              let hash = client.get_block_hash((*height).into())?;
              Ok(client.get_block(&hash)?)
            },
          )
          .collect::<Result<Vec<Block>>>();

        match blocks {
          Ok(blocks) => {
            for block in blocks {
              if tx.send(block).is_err() {
                return;
              }
            }
          }
          Err(err) => {
            log::error!("failed to fetch blocks starting at {height}: {err}");
            return;
          }
        }

        height += chunk;
      }
    });

    Ok(rx)
  }

  fn index_block(&mut self, block: Block) -> Result {
    // the store is append-only past the confirmation depth; a mismatch here
    // means a reorg deeper than we support
    if self.height > 0 {
      if let Some(stored) = self.index.block_hash(Some(self.height - 1))? {
        ensure!(
          block.header.prev_blockhash == stored,
          "reorg detected at height {}: expected previous block hash {stored}, got {}",
          self.height,
          block.header.prev_blockhash,
        );
      }
    }

    let dunestones = block
      .txdata
      .iter()
      .map(Dunestone::from_transaction)
      .collect::<Vec<Option<Dunestone>>>();

    let mut cache = BlockCache::load(self.index, self.height, &block, &dunestones)?;

    let mut dune_updater = DuneUpdater::new(
      self.index,
      &mut cache,
      self.index.chain,
      self.index.first_dune_height,
      self.height,
    );

    for (tx_index, tx) in block.txdata.iter().enumerate() {
      let tx_index = u32::try_from(tx_index).context("transaction index exceeds u32")?;
      dune_updater.index_transaction(
        tx_index,
        tx,
        tx.txid(),
        dunestones[usize::try_from(tx_index)?].as_ref(),
      )?;
    }

    cache.flush(self.index)?;

    log::info!(
      "Indexed block {} ({} transactions)",
      self.height,
      block.txdata.len()
    );

    Ok(())
  }
}
