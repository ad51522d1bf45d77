use super::*;

lazy_static! {
  static ref NAME: Regex = Regex::new(r"^[A-Za-z0-9_.-]{1,31}$").unwrap();
}

#[derive(Default, Serialize, Debug, PartialEq)]
pub struct Dunestone {
  pub edicts: Vec<Edict>,
  pub etching: Option<Etching>,
  pub mint: Option<DuneId>,
  pub pointer: Option<u32>,
  pub cenotaph: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Payload {
  p: String,
  edicts: Option<Vec<PayloadEdict>>,
  etching: Option<PayloadEtching>,
  mint: Option<String>,
  pointer: Option<u32>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PayloadEdict {
  id: String,
  amount: String,
  output: u32,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PayloadEtching {
  divisibility: Option<u8>,
  premine: Option<String>,
  dune: Option<String>,
  symbol: Option<String>,
  terms: Option<PayloadTerms>,
  turbo: Option<bool>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PayloadTerms {
  amount: String,
  cap: Option<String>,
  height: (Option<u32>, Option<u32>),
  offset: (Option<u32>, Option<u32>),
  price: Option<PayloadPrice>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PayloadPrice {
  amount: u64,
  pay_to: String,
}

impl Dunestone {
  /// Extracts the dunestone carried by `transaction`, if any. `None` means
  /// the transaction has no `OP_RETURN` output at all; a malformed payload
  /// in the first `OP_RETURN` output yields a cenotaph.
  pub fn from_transaction(transaction: &Transaction) -> Option<Self> {
    let payload = match Self::payload(transaction)? {
      Ok(payload) => payload,
      Err(_) => return Some(Self::cenotaph()),
    };

    Some(match Self::decipher(&payload, transaction) {
      Ok(dunestone) => dunestone,
      Err(error) => {
        log::debug!("cenotaph: {error}");
        Self::cenotaph()
      }
    })
  }

  fn cenotaph() -> Self {
    Self {
      cenotaph: true,
      ..Default::default()
    }
  }

  fn payload(transaction: &Transaction) -> Option<Result<Vec<u8>, script::Error>> {
    for output in &transaction.output {
      if !output.script_pubkey.is_op_return() {
        continue;
      }

      let mut payload = Vec::new();

      for instruction in output.script_pubkey.instructions() {
        match instruction {
          Ok(Instruction::PushBytes(push)) => payload.extend_from_slice(push),
          Ok(Instruction::Op(_)) => {}
          Err(error) => return Some(Err(error)),
        }
      }

      return Some(Ok(payload));
    }

    None
  }

  fn decipher(payload: &[u8], transaction: &Transaction) -> Result<Self> {
    let payload = std::str::from_utf8(payload).context("payload is not UTF-8")?;

    let payload: Payload = serde_json::from_str(payload).context("payload is not valid JSON")?;

    ensure!(
      PROTOCOL_IDENTIFIERS.contains(&payload.p.as_str()),
      "unrecognized protocol identifier: `{}`",
      payload.p,
    );

    let etching = payload
      .etching
      .map(|etching| Self::decipher_etching(etching))
      .transpose()?;

    let mint = payload
      .mint
      .as_deref()
      .map(|mint| {
        mint
          .parse::<DuneId>()
          .with_context(|| format!("invalid mint id: `{mint}`"))
      })
      .transpose()?;

    let mut cenotaph = false;
    let mut edicts = Vec::new();

    for edict in payload.edicts.unwrap_or_default() {
      match Edict::from_payload(
        &edict.id,
        &edict.amount,
        edict.output,
        transaction.output.len(),
      ) {
        Some(edict) => edicts.push(edict),
        None => cenotaph = true,
      }
    }

    Ok(Self {
      edicts,
      etching,
      mint,
      pointer: payload.pointer,
      cenotaph,
    })
  }

  fn decipher_etching(etching: PayloadEtching) -> Result<Etching> {
    if let Some(divisibility) = etching.divisibility {
      ensure!(
        divisibility <= MAX_DIVISIBILITY,
        "divisibility {divisibility} exceeds maximum {MAX_DIVISIBILITY}",
      );
    }

    let premine = etching
      .premine
      .as_deref()
      .map(parse_amount)
      .transpose()
      .context("invalid premine")?;

    let dune = etching
      .dune
      .as_deref()
      .map(|name| -> Result<Dune> {
        ensure!(NAME.is_match(name), "invalid dune name: `{name}`");
        name
          .to_uppercase()
          .parse()
          .with_context(|| format!("dune name has no base-26 form: `{name}`"))
      })
      .transpose()?;

    let symbol = etching
      .symbol
      .as_deref()
      .map(|symbol| -> Result<char> {
        let mut chars = symbol.chars();
        match (chars.next(), chars.next()) {
          (Some(c), None) => Ok(c),
          _ => bail!("symbol must be a single codepoint: `{symbol}`"),
        }
      })
      .transpose()?;

    let terms = etching
      .terms
      .map(|terms| -> Result<Terms> {
        Ok(Terms {
          amount: parse_amount(&terms.amount).context("invalid terms amount")?,
          cap: terms
            .cap
            .as_deref()
            .map(parse_amount)
            .transpose()
            .context("invalid terms cap")?,
          height: terms.height,
          offset: terms.offset,
          price: terms.price.map(|price| Price {
            amount: price.amount,
            pay_to: price.pay_to,
          }),
        })
      })
      .transpose()?;

    Ok(Etching {
      divisibility: etching.divisibility,
      premine,
      dune,
      symbol,
      terms,
      turbo: etching.turbo.unwrap_or(true),
    })
  }

  /// Builds the OP_RETURN script that carries this dunestone. Used by tests
  /// and by anyone constructing dunestone transactions.
  pub fn encipher(&self) -> Script {
    let mut payload = serde_json::Map::new();

    payload.insert("p".into(), "dunes".into());

    if !self.edicts.is_empty() {
      payload.insert(
        "edicts".into(),
        self
          .edicts
          .iter()
          .map(|edict| {
            serde_json::json!({
              "id": edict.id.to_string(),
              "amount": edict.amount.to_string(),
              "output": edict.output,
            })
          })
          .collect::<Vec<serde_json::Value>>()
          .into(),
      );
    }

    if let Some(etching) = &self.etching {
      let mut value = serde_json::Map::new();

      if let Some(divisibility) = etching.divisibility {
        value.insert("divisibility".into(), divisibility.into());
      }

      if let Some(premine) = etching.premine {
        value.insert("premine".into(), premine.to_string().into());
      }

      if let Some(dune) = etching.dune {
        value.insert("dune".into(), dune.to_string().into());
      }

      if let Some(symbol) = etching.symbol {
        value.insert("symbol".into(), symbol.to_string().into());
      }

      if let Some(terms) = &etching.terms {
        let mut terms_value = serde_json::Map::new();
        terms_value.insert("amount".into(), terms.amount.to_string().into());
        if let Some(cap) = terms.cap {
          terms_value.insert("cap".into(), cap.to_string().into());
        }
        terms_value.insert("height".into(), serde_json::json!(terms.height));
        terms_value.insert("offset".into(), serde_json::json!(terms.offset));
        if let Some(price) = &terms.price {
          terms_value.insert(
            "price".into(),
            serde_json::json!({ "amount": price.amount, "pay_to": price.pay_to }),
          );
        }
        value.insert("terms".into(), terms_value.into());
      }

      value.insert("turbo".into(), etching.turbo.into());

      payload.insert("etching".into(), value.into());
    }

    if let Some(mint) = self.mint {
      payload.insert("mint".into(), mint.to_string().into());
    }

    if let Some(pointer) = self.pointer {
      payload.insert("pointer".into(), pointer.into());
    }

    let payload = serde_json::Value::Object(payload).to_string();

    script::Builder::new()
      .push_opcode(opcodes::all::OP_RETURN)
      .push_slice(payload.as_bytes())
      .into_script()
  }
}

#[cfg(test)]
mod tests {
  use {super::*, bitcoin::PackedLockTime, pretty_assertions::assert_eq};

  fn transaction(output: Vec<Script>) -> Transaction {
    Transaction {
      version: 2,
      lock_time: PackedLockTime::ZERO,
      input: Vec::new(),
      output: output
        .into_iter()
        .map(|script_pubkey| TxOut {
          value: 0,
          script_pubkey,
        })
        .collect(),
    }
  }

  fn op_return(payload: &str) -> Script {
    script::Builder::new()
      .push_opcode(opcodes::all::OP_RETURN)
      .push_slice(payload.as_bytes())
      .into_script()
  }

  fn recipient() -> Script {
    Script::new_v0_p2wpkh(&bitcoin::WPubkeyHash::hash(&[0]))
  }

  fn decipher(payload: &str) -> Option<Dunestone> {
    Dunestone::from_transaction(&transaction(vec![recipient(), op_return(payload)]))
  }

  #[test]
  fn transaction_without_op_return_has_no_dunestone() {
    assert_eq!(
      Dunestone::from_transaction(&transaction(vec![recipient()])),
      None
    );
  }

  #[test]
  fn non_utf8_payload_is_a_cenotaph() {
    let script = script::Builder::new()
      .push_opcode(opcodes::all::OP_RETURN)
      .push_slice(&[0xFF, 0xFE])
      .into_script();

    assert_eq!(
      Dunestone::from_transaction(&transaction(vec![script])),
      Some(Dunestone {
        cenotaph: true,
        ..Default::default()
      })
    );
  }

  #[test]
  fn invalid_json_is_a_cenotaph() {
    assert_eq!(
      decipher("charley loves heidi"),
      Some(Dunestone {
        cenotaph: true,
        ..Default::default()
      })
    );
  }

  #[test]
  fn unrecognized_protocol_identifier_is_a_cenotaph() {
    assert_eq!(
      decipher(r#"{"p":"runes"}"#),
      Some(Dunestone {
        cenotaph: true,
        ..Default::default()
      })
    );
  }

  #[test]
  fn unknown_fields_are_a_cenotaph() {
    assert_eq!(
      decipher(r#"{"p":"dunes","deadline":1}"#),
      Some(Dunestone {
        cenotaph: true,
        ..Default::default()
      })
    );
  }

  #[test]
  fn empty_dunestone_is_not_a_cenotaph() {
    assert_eq!(decipher(r#"{"p":"dunes"}"#), Some(Dunestone::default()));
    assert_eq!(
      decipher(r#"{"p":"https://dunes.sh"}"#),
      Some(Dunestone::default())
    );
  }

  #[test]
  fn only_the_first_op_return_is_deciphered() {
    assert_eq!(
      Dunestone::from_transaction(&transaction(vec![
        op_return(r#"{"p":"dunes","pointer":0}"#),
        op_return("junk"),
      ])),
      Some(Dunestone {
        pointer: Some(0),
        ..Default::default()
      })
    );
  }

  #[test]
  fn deciphering_a_full_etching() {
    assert_eq!(
      decipher(
        r#"{
          "p": "dunes",
          "etching": {
            "divisibility": 2,
            "premine": "1000",
            "dune": "HELLO",
            "symbol": "¤",
            "terms": {
              "amount": "10",
              "cap": "100",
              "height": [null, null],
              "offset": [null, null]
            },
            "turbo": true
          }
        }"#
      ),
      Some(Dunestone {
        etching: Some(Etching {
          divisibility: Some(2),
          premine: Some(1000),
          dune: Some("HELLO".parse().unwrap()),
          symbol: Some('¤'),
          terms: Some(Terms {
            amount: 10,
            cap: Some(100),
            height: (None, None),
            offset: (None, None),
            price: None,
          }),
          turbo: true,
        }),
        ..Default::default()
      })
    );
  }

  #[test]
  fn lowercase_names_are_uppercased() {
    assert_eq!(
      decipher(r#"{"p":"dunes","etching":{"dune":"hello"}}"#)
        .unwrap()
        .etching
        .unwrap()
        .dune,
      Some("HELLO".parse().unwrap()),
    );
  }

  #[test]
  fn names_without_a_base_26_form_are_a_cenotaph() {
    assert_eq!(
      decipher(r#"{"p":"dunes","etching":{"dune":"DUNE-1"}}"#),
      Some(Dunestone {
        cenotaph: true,
        ..Default::default()
      })
    );
  }

  #[test]
  fn names_longer_than_the_limit_are_a_cenotaph() {
    let name = "A".repeat(MAX_NAME_LENGTH + 1);
    assert_eq!(
      decipher(&format!(r#"{{"p":"dunes","etching":{{"dune":"{name}"}}}}"#)),
      Some(Dunestone {
        cenotaph: true,
        ..Default::default()
      })
    );
  }

  #[test]
  fn turbo_defaults_to_true() {
    assert_eq!(
      decipher(r#"{"p":"dunes","etching":{"dune":"HELLO"}}"#)
        .unwrap()
        .etching
        .unwrap()
        .turbo,
      true,
    );
  }

  #[test]
  fn excessive_divisibility_is_a_cenotaph() {
    assert_eq!(
      decipher(r#"{"p":"dunes","etching":{"divisibility":19}}"#),
      Some(Dunestone {
        cenotaph: true,
        ..Default::default()
      })
    );
  }

  #[test]
  fn multi_codepoint_symbol_is_a_cenotaph() {
    assert_eq!(
      decipher(r#"{"p":"dunes","etching":{"symbol":"ab"}}"#),
      Some(Dunestone {
        cenotaph: true,
        ..Default::default()
      })
    );
  }

  #[test]
  fn amounts_out_of_range_are_a_cenotaph() {
    assert_eq!(
      decipher(
        r#"{"p":"dunes","etching":{"premine":"340282366920938463463374607431768211456"}}"#
      ),
      Some(Dunestone {
        cenotaph: true,
        ..Default::default()
      })
    );
  }

  #[test]
  fn mint_is_deciphered() {
    assert_eq!(
      decipher(r#"{"p":"dunes","mint":"840000:33"}"#),
      Some(Dunestone {
        mint: Some(DuneId {
          block: 840000,
          tx: 33
        }),
        ..Default::default()
      })
    );
  }

  #[test]
  fn invalid_mint_id_is_a_cenotaph() {
    assert_eq!(
      decipher(r#"{"p":"dunes","mint":"840000"}"#),
      Some(Dunestone {
        cenotaph: true,
        ..Default::default()
      })
    );
  }

  #[test]
  fn edicts_are_deciphered() {
    assert_eq!(
      decipher(
        r#"{"p":"dunes","edicts":[{"id":"840000:1","amount":"100","output":0},{"id":"0:0","amount":"0","output":1}]}"#
      ),
      Some(Dunestone {
        edicts: vec![
          Edict {
            id: DuneId {
              block: 840000,
              tx: 1
            },
            amount: 100,
            output: 0,
          },
          Edict {
            id: DuneId { block: 0, tx: 0 },
            amount: 0,
            output: 1,
          },
        ],
        ..Default::default()
      })
    );
  }

  #[test]
  fn edict_output_beyond_output_count_is_a_cenotaph() {
    // the transaction built by `decipher` has two outputs
    assert_eq!(
      decipher(r#"{"p":"dunes","edicts":[{"id":"840000:1","amount":"1","output":99}]}"#),
      Some(Dunestone {
        cenotaph: true,
        ..Default::default()
      })
    );
  }

  #[test]
  fn edict_with_zero_block_and_nonzero_tx_is_a_cenotaph() {
    assert_eq!(
      decipher(r#"{"p":"dunes","edicts":[{"id":"0:1","amount":"1","output":0}]}"#),
      Some(Dunestone {
        cenotaph: true,
        ..Default::default()
      })
    );
  }

  #[test]
  fn cenotaph_from_edicts_keeps_the_etching() {
    let dunestone = decipher(
      r#"{"p":"dunes","etching":{"dune":"HELLO"},"edicts":[{"id":"0:1","amount":"1","output":0}]}"#,
    )
    .unwrap();

    assert!(dunestone.cenotaph);
    assert_eq!(dunestone.etching.unwrap().dune, Some("HELLO".parse().unwrap()));
  }

  #[test]
  fn flex_terms_are_deciphered() {
    assert_eq!(
      decipher(
        r#"{"p":"dunes","etching":{"dune":"HELLO","terms":{"amount":"0","height":[null,null],"offset":[null,null],"price":{"amount":1000,"pay_to":"bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4"}}}}"#
      )
      .unwrap()
      .etching
      .unwrap()
      .terms,
      Some(Terms {
        amount: 0,
        cap: None,
        height: (None, None),
        offset: (None, None),
        price: Some(Price {
          amount: 1000,
          pay_to: "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".into(),
        }),
      })
    );
  }

  #[test]
  fn terms_without_height_and_offset_are_a_cenotaph() {
    assert_eq!(
      decipher(r#"{"p":"dunes","etching":{"dune":"HELLO","terms":{"amount":"10"}}}"#),
      Some(Dunestone {
        cenotaph: true,
        ..Default::default()
      })
    );
  }

  #[test]
  fn encipher_round_trips() {
    let dunestone = Dunestone {
      edicts: vec![Edict {
        id: DuneId {
          block: 840000,
          tx: 1,
        },
        amount: 11,
        output: 3,
      }],
      etching: Some(Etching {
        divisibility: Some(2),
        premine: Some(1000),
        dune: Some("HELLO".parse().unwrap()),
        symbol: Some('¤'),
        terms: Some(Terms {
          amount: 10,
          cap: Some(100),
          height: (Some(840_000), None),
          offset: (None, Some(1000)),
          price: Some(Price {
            amount: 1000,
            pay_to: "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".into(),
          }),
        }),
        turbo: true,
      }),
      mint: Some(DuneId {
        block: 840000,
        tx: 2,
      }),
      pointer: Some(1),
      cenotaph: false,
    };

    let transaction = transaction(vec![
      recipient(),
      recipient(),
      recipient(),
      dunestone.encipher(),
    ]);

    assert_eq!(Dunestone::from_transaction(&transaction), Some(dunestone));
  }
}
