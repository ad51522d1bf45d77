use {
  crate::dunes::{COMMIT_CONFIRMATIONS, TAPROOT_ANNEX_PREFIX, TAPROOT_SCRIPT_PUBKEY_TYPE},
  super::*,
};

/// Looks up the output a commitment input spends. Only the script type and
/// the confirmation height matter; errors here abort the block.
pub(crate) trait PreviousOutputFetcher {
  fn previous_output(&self, outpoint: &OutPoint) -> Result<Option<PreviousOutput>>;
}

#[derive(Debug, Clone)]
pub(crate) struct PreviousOutput {
  pub(crate) script_type: String,
  pub(crate) height: Option<u32>,
}

impl PreviousOutputFetcher for Index {
  fn previous_output(&self, outpoint: &OutPoint) -> Result<Option<PreviousOutput>> {
    let Some(info) = self
      .client
      .get_raw_transaction_info(&outpoint.txid, None)
      .into_option()?
    else {
      return Ok(None);
    };

    let Some(vout) = info.vout.get(usize::try_from(outpoint.vout)?) else {
      return Ok(None);
    };

    let script_type = vout
      .script_pub_key
      .type_
      .map(|type_| {
        serde_json::to_value(type_)
          .ok()
          .and_then(|value| value.as_str().map(str::to_string))
          .unwrap_or_default()
      })
      .unwrap_or_default();

    let height = info
      .blockhash
      .map(|hash| self.client.get_block_header_info(&hash))
      .transpose()?
      .map(|header| u32::try_from(header.height))
      .transpose()?;

    Ok(Some(PreviousOutput {
      script_type,
      height,
    }))
  }
}

struct PendingUtxo {
  address_id: u64,
  op_return: bool,
  value: u64,
  balances: BTreeMap<DuneId, u128>,
}

pub(super) struct DuneUpdater<'a, F: PreviousOutputFetcher> {
  cache: &'a mut BlockCache,
  chain: Chain,
  fetcher: &'a F,
  first_dune_height: u32,
  height: u32,
}

impl<'a, F: PreviousOutputFetcher> DuneUpdater<'a, F> {
  pub(super) fn new(
    fetcher: &'a F,
    cache: &'a mut BlockCache,
    chain: Chain,
    first_dune_height: u32,
    height: u32,
  ) -> Self {
    Self {
      cache,
      chain,
      fetcher,
      first_dune_height,
      height,
    }
  }

  pub(super) fn index_transaction(
    &mut self,
    tx_index: u32,
    tx: &Transaction,
    txid: Txid,
    dunestone: Option<&Dunestone>,
  ) -> Result<()> {
    let is_genesis_coinbase =
      self.height == self.first_dune_height && tx_index == 0 && tx.is_coin_base();

    // gather inputs
    let mut input_utxos: Vec<((u64, u32), UtxoEntry, Vec<(DuneId, u128)>)> = Vec::new();

    for input in &tx.input {
      if input.previous_output.is_null() {
        continue;
      }

      let Some(transaction_id) = self
        .cache
        .existing_transaction_id(&input.previous_output.txid)
      else {
        continue;
      };

      let key = (transaction_id, input.previous_output.vout);

      let Some(utxo) = self.cache.utxo(&key) else {
        continue;
      };

      ensure!(
        utxo.block_spent.is_none(),
        "utxo {}:{} consumed twice",
        input.previous_output.txid,
        input.previous_output.vout,
      );

      let balances = self
        .cache
        .utxo_balances(utxo.id)
        .cloned()
        .unwrap_or_default();

      input_utxos.push((key, *utxo, balances));
    }

    let has_actions = dunestone
      .map(|dunestone| {
        dunestone.etching.is_some() || dunestone.mint.is_some() || !dunestone.edicts.is_empty()
      })
      .unwrap_or(false);

    // a transaction that neither consumes indexed utxos nor performs any
    // dunestone action changes nothing
    if input_utxos.is_empty() && !has_actions && !is_genesis_coinbase {
      return Ok(());
    }

    let mut unallocated: BTreeMap<DuneId, u128> = BTreeMap::new();

    for (_, _, balances) in &input_utxos {
      for (id, amount) in balances {
        let balance = unallocated.entry(*id).or_default();
        *balance = balance
          .checked_add(*amount)
          .ok_or_else(|| anyhow!("input balances of {id} overflow"))?;
      }
    }

    let sender_address_id = if tx.is_coin_base() {
      COINBASE_ADDRESS_ID
    } else if let Some((_, utxo, _)) = input_utxos.first() {
      utxo.address_id
    } else {
      UNKNOWN_ADDRESS_ID
    };

    let transaction_id = self.cache.transaction_id(txid);

    let cenotaph = dunestone
      .map(|dunestone| dunestone.cenotaph)
      .unwrap_or_default();

    // pending outputs
    let mut pending: Vec<PendingUtxo> = tx
      .output
      .iter()
      .map(|output| {
        let op_return = output.script_pubkey.is_op_return();
        let address_id = if op_return {
          OP_RETURN_ADDRESS_ID
        } else {
          match self.chain.address_from_script(&output.script_pubkey) {
            Ok(address) => self.cache.address_id(address.to_string()),
            Err(_) => UNKNOWN_ADDRESS_ID,
          }
        };

        PendingUtxo {
          address_id,
          op_return,
          value: output.value,
          balances: BTreeMap::new(),
        }
      })
      .collect();

    // etching
    let etched = if is_genesis_coinbase {
      self.etch(
        tx,
        tx_index,
        transaction_id,
        &dunes::genesis_etching(self.first_dune_height),
        false,
        COINBASE_ADDRESS_ID,
        true,
      )?
    } else if let Some(etching) = dunestone.and_then(|dunestone| dunestone.etching.as_ref()) {
      self.etch(
        tx,
        tx_index,
        transaction_id,
        etching,
        cenotaph,
        sender_address_id,
        false,
      )?
    } else {
      None
    };

    if let Some((id, premine)) = etched {
      if !cenotaph && premine > 0 {
        let balance = unallocated.entry(id).or_default();
        *balance = balance
          .checked_add(premine)
          .ok_or_else(|| anyhow!("premine of {id} overflows input balances"))?;
      }
    }

    // mint
    if let Some(mint) = dunestone.and_then(|dunestone| dunestone.mint) {
      self.mint(
        tx,
        tx_index,
        mint,
        transaction_id,
        sender_address_id,
        cenotaph,
        &mut unallocated,
      )?;
    }

    // edict allocation; to = the OP_RETURN sink records a burn
    let mut transfers: BTreeMap<(u64, DuneId), u128> = BTreeMap::new();

    if cenotaph {
      for (id, amount) in &unallocated {
        if *amount > 0 {
          *transfers.entry((OP_RETURN_ADDRESS_ID, *id)).or_default() += *amount;
        }
      }
    } else {
      let etched_id = etched.map(|(id, _)| id);

      for edict in dunestone.map(|dunestone| dunestone.edicts.as_slice()).unwrap_or_default() {
        let id = if edict.id.is_self_reference() {
          match etched_id {
            Some(id) => id,
            None => continue,
          }
        } else {
          edict.id
        };

        if self.cache.dune(id).is_none() {
          continue;
        }

        if !unallocated.contains_key(&id) {
          continue;
        }

        let output = usize::try_from(edict.output)?;

        if output == pending.len() {
          let destinations = pending
            .iter()
            .enumerate()
            .filter_map(|(vout, utxo)| (!utxo.op_return).then_some(vout))
            .collect::<Vec<usize>>();

          if destinations.is_empty() {
            continue;
          }

          if edict.amount == 0 {
            let have = unallocated.get(&id).copied().unwrap_or_default();
            let amount = have / destinations.len() as u128;
            let remainder = usize::try_from(have % destinations.len() as u128)?;

            for (i, vout) in destinations.iter().enumerate() {
              allocate(
                &mut unallocated,
                &mut pending[*vout],
                &mut transfers,
                id,
                if i < remainder { amount + 1 } else { amount },
              );
            }
          } else {
            for vout in destinations {
              allocate(
                &mut unallocated,
                &mut pending[vout],
                &mut transfers,
                id,
                edict.amount,
              );
            }
          }
        } else {
          allocate(
            &mut unallocated,
            &mut pending[output],
            &mut transfers,
            id,
            edict.amount,
          );
        }
      }

      // pointer sweep: residual balances go to one output
      let residual = unallocated
        .iter()
        .filter(|(_, amount)| **amount > 0)
        .map(|(id, amount)| (*id, *amount))
        .collect::<Vec<(DuneId, u128)>>();

      if !residual.is_empty() {
        let vout = dunestone
          .and_then(|dunestone| dunestone.pointer)
          .and_then(|pointer| usize::try_from(pointer).ok())
          .filter(|pointer| *pointer < pending.len())
          .or_else(|| pending.iter().position(|utxo| !utxo.op_return))
          .or_else(|| pending.iter().position(|utxo| utxo.op_return));

        let Some(vout) = vout else {
          bail!("transaction {txid} has no output to receive unallocated dunes");
        };

        for (id, amount) in residual {
          allocate(&mut unallocated, &mut pending[vout], &mut transfers, id, amount);
        }
      }
    }

    debug_assert!(cenotaph || unallocated.values().all(|amount| *amount == 0));

    // events, transfers before burns
    for ((to, id), amount) in &transfers {
      if *to == OP_RETURN_ADDRESS_ID {
        continue;
      }

      self.cache.record_event(Event {
        kind: EventKind::Transfer,
        block: self.height,
        transaction_id,
        dune_id: *id,
        amount: *amount,
        from_address_id: sender_address_id,
        to_address_id: *to,
      });
    }

    for ((to, id), amount) in &transfers {
      if *to != OP_RETURN_ADDRESS_ID {
        continue;
      }

      self.cache.record_event(Event {
        kind: EventKind::Burn,
        block: self.height,
        transaction_id,
        dune_id: *id,
        amount: *amount,
        from_address_id: sender_address_id,
        to_address_id: OP_RETURN_ADDRESS_ID,
      });
    }

    // consume inputs
    for (key, utxo, balances) in &input_utxos {
      self.cache.spend_utxo(*key, transaction_id)?;

      for (id, amount) in balances {
        self.cache.sub_balance(utxo.address_id, *id, *amount)?;
      }
    }

    // balances routed to the sink are burned
    for ((to, id), amount) in &transfers {
      if *to != OP_RETURN_ADDRESS_ID {
        continue;
      }

      let entry = self
        .cache
        .dune_mut(*id)
        .ok_or_else(|| anyhow!("burned dune {id} missing from block cache"))?;

      entry.burned = entry
        .burned
        .checked_add(*amount)
        .ok_or_else(|| anyhow!("burned amount of {id} overflows"))?;
    }

    // persist funded outputs; OP_RETURN and empty outputs are dropped
    for (vout, utxo) in pending.into_iter().enumerate() {
      if utxo.op_return || utxo.balances.is_empty() {
        continue;
      }

      let balances = utxo
        .balances
        .into_iter()
        .collect::<Vec<(DuneId, u128)>>();

      self.cache.create_utxo(
        (transaction_id, u32::try_from(vout)?),
        utxo.address_id,
        utxo.value,
        balances.clone(),
      );

      for (id, amount) in balances {
        self.cache.add_balance(utxo.address_id, id, amount)?;
      }
    }

    Ok(())
  }

  fn etch(
    &mut self,
    tx: &Transaction,
    tx_index: u32,
    transaction_id: u64,
    etching: &Etching,
    cenotaph: bool,
    sender_address_id: u64,
    is_genesis: bool,
  ) -> Result<Option<(DuneId, u128)>> {
    let id = if is_genesis {
      DuneId::GENESIS
    } else {
      DuneId::new(self.height, tx_index)
    };

    if self.cache.dune(id).is_some() {
      return Ok(None);
    }

    let dune = match etching.dune {
      Some(dune) => dune,
      None => Dune::reserved(self.height, tx_index),
    };

    if etching.dune.is_some() && !is_genesis {
      if dune.is_reserved() {
        return Ok(None);
      }

      if self.cache.dune_id_by_name(dune).is_some() {
        return Ok(None);
      }

      if dune.length() < Dune::minimum_length_at_height(self.chain, Height(self.height)) {
        return Ok(None);
      }
    }

    if let Some(terms) = &etching.terms {
      // amount zero without a price has no way to ever mint
      if terms.amount == 0 && terms.price.is_none() {
        return Ok(None);
      }

      // flex dunes are capped by payment, never by count
      if terms.is_flex() && terms.cap.is_some() {
        return Ok(None);
      }
    }

    if etching.dune.is_some() && !is_genesis && !self.commitment_confirmed(tx, dune)? {
      return Ok(None);
    }

    // a cenotaph etching creates the dune but nothing materializes
    let premine = if cenotaph {
      0
    } else {
      etching.premine.unwrap_or_default()
    };

    self.cache.create_dune(
      id,
      DuneEntry {
        burned: 0,
        deployer_address_id: sender_address_id,
        divisibility: etching.divisibility.unwrap_or_default(),
        dune,
        etching_transaction_id: transaction_id,
        mints: 0,
        number: 0,
        premine,
        symbol: etching.symbol,
        terms: etching.terms.clone(),
        turbo: etching.turbo,
        unmintable: cenotaph || etching.terms.is_none(),
      },
    );

    self.cache.record_event(Event {
      kind: EventKind::Etch,
      block: self.height,
      transaction_id,
      dune_id: id,
      amount: premine,
      from_address_id: sender_address_id,
      to_address_id: sender_address_id,
    });

    Ok(Some((id, premine)))
  }

  fn mint(
    &mut self,
    tx: &Transaction,
    tx_index: u32,
    id: DuneId,
    transaction_id: u64,
    sender_address_id: u64,
    cenotaph: bool,
    unallocated: &mut BTreeMap<DuneId, u128>,
  ) -> Result<()> {
    let Some(entry) = self.cache.dune(id) else {
      return Ok(());
    };

    let entry = entry.clone();

    let Some(terms) = entry.terms.clone() else {
      return Ok(());
    };

    if !self.price_terms_met(&terms, tx) {
      return Ok(());
    }

    if let Err(error) = entry.mintable(id, self.height, tx_index) {
      log::debug!("mint of {id} rejected: {error}");
      return Ok(());
    }

    if cenotaph {
      // the mint is consumed but its units are never created
      if let Some(entry) = self.cache.dune_mut(id) {
        entry.mints += 1;
      }
      return Ok(());
    }

    let amount = match &terms.price {
      Some(price) if terms.amount == 0 => {
        u128::from(self.sats_paid_to(tx, &price.pay_to)) / u128::from(price.amount)
      }
      _ => terms.amount,
    };

    if amount == 0 {
      return Ok(());
    }

    if let Some(entry) = self.cache.dune_mut(id) {
      entry.mints += 1;
    }

    self.cache.record_event(Event {
      kind: EventKind::Mint,
      block: self.height,
      transaction_id,
      dune_id: id,
      amount,
      from_address_id: COINBASE_ADDRESS_ID,
      to_address_id: sender_address_id,
    });

    let balance = unallocated.entry(id).or_default();
    *balance = balance
      .checked_add(amount)
      .ok_or_else(|| anyhow!("mint overflows unallocated balance of {id}"))?;

    Ok(())
  }

  fn price_terms_met(&self, terms: &Terms, tx: &Transaction) -> bool {
    match &terms.price {
      None => true,
      Some(price) => {
        price.amount > 0
          && tx
            .output
            .iter()
            .any(|output| self.pays_to(output, &price.pay_to))
      }
    }
  }

  fn pays_to(&self, output: &TxOut, pay_to: &str) -> bool {
    self
      .chain
      .address_from_script(&output.script_pubkey)
      .map(|address| address.to_string() == pay_to)
      .unwrap_or(false)
  }

  fn sats_paid_to(&self, tx: &Transaction, pay_to: &str) -> u64 {
    tx.output
      .iter()
      .filter(|output| self.pays_to(output, pay_to))
      .map(|output| output.value)
      .sum()
  }

  /// A named etching is only valid if one of the transaction's inputs
  /// reveals the name commitment in a tapscript whose previous output is a
  /// taproot output confirmed at least `COMMIT_CONFIRMATIONS` blocks ago.
  fn commitment_confirmed(&self, tx: &Transaction, dune: Dune) -> Result<bool> {
    let commitment = dune.commitment();

    for input in &tx.input {
      if input.previous_output.is_null() {
        continue;
      }

      let stack = input.witness.iter().collect::<Vec<&[u8]>>();

      // the tapscript is the second-to-last witness element, or the
      // third-to-last when the final element is an annex
      let offset = if stack.len() >= 2
        && stack
          .last()
          .map(|element| element.first() == Some(&TAPROOT_ANNEX_PREFIX))
          .unwrap_or_default()
      {
        3
      } else {
        2
      };

      if offset > stack.len() {
        continue;
      }

      let script = Script::from(stack[stack.len() - offset].to_vec());

      let mut found = false;
      for instruction in script.instructions() {
        match instruction {
          Ok(Instruction::PushBytes(push)) if push == commitment.as_slice() => {
            found = true;
            break;
          }
          Ok(_) => {}
          Err(_) => break,
        }
      }

      if !found {
        continue;
      }

      log::debug!(
        "commitment {} revealed by input spending {}",
        hex::encode(&commitment),
        input.previous_output,
      );

      let Some(previous) = self.fetcher.previous_output(&input.previous_output)? else {
        continue;
      };

      if previous.script_type != TAPROOT_SCRIPT_PUBKEY_TYPE {
        continue;
      }

      let Some(commit_height) = previous.height else {
        continue;
      };

      if self.height.saturating_sub(commit_height) + 1 >= COMMIT_CONFIRMATIONS {
        return Ok(true);
      }
    }

    Ok(false)
  }
}

fn allocate(
  unallocated: &mut BTreeMap<DuneId, u128>,
  utxo: &mut PendingUtxo,
  transfers: &mut BTreeMap<(u64, DuneId), u128>,
  id: DuneId,
  amount: u128,
) {
  let have = unallocated.get(&id).copied().unwrap_or_default();

  // an amount of zero requests everything that is left
  let give = if amount == 0 || have < amount {
    have
  } else {
    amount
  };

  if give == 0 {
    return;
  }

  *unallocated.entry(id).or_default() -= give;
  *utxo.balances.entry(id).or_default() += give;
  *transfers.entry((utxo.address_id, id)).or_default() += give;
}
