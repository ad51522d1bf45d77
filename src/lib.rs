#![allow(
  clippy::too_many_arguments,
  clippy::type_complexity,
  clippy::result_large_err
)]
#![deny(
  clippy::cast_lossless,
  clippy::cast_possible_truncation,
  clippy::cast_possible_wrap,
  clippy::cast_sign_loss
)]

use {
  self::{
    arguments::Arguments,
    config::Config,
    deserialize_from_str::DeserializeFromStr,
    height::Height,
    index::Index,
    options::Options,
    subcommand::Subcommand,
  },
  anyhow::{anyhow, bail, ensure, Context, Error},
  bitcoin::{
    blockdata::opcodes,
    blockdata::script::{self, Instruction},
    hash_types::BlockHash,
    hashes::Hash,
    Address, Block, Network, OutPoint, Script, Transaction, TxIn, TxOut, Txid, Witness,
  },
  bitcoincore_rpc::{Client, RpcApi},
  chain::Chain,
  clap::{ArgGroup, Parser},
  derive_more::{Display, FromStr},
  lazy_static::lazy_static,
  regex::Regex,
  serde::{Deserialize, Deserializer, Serialize, Serializer},
  std::{
    cmp,
    collections::{BTreeMap, BTreeSet, HashMap},
    env,
    fmt::{self, Display, Formatter},
    fs::{self, File},
    io,
    net::ToSocketAddrs,
    path::{Path, PathBuf},
    process,
    str::FromStr,
    sync::{
      atomic::{self, AtomicBool},
      mpsc, Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
  },
  tokio::runtime::Runtime,
};

pub use self::dunes::{Dune, DuneId, Dunestone, Edict, Etching, MintError, Price, Terms};

mod arguments;
mod chain;
mod config;
mod deserialize_from_str;
mod height;
mod index;
mod options;
pub mod dunes;
pub mod subcommand;

type Result<T = (), E = Error> = std::result::Result<T, E>;

static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);
static LISTENERS: Mutex<Vec<axum_server::Handle>> = Mutex::new(Vec::new());
static INDEXER: Mutex<Option<thread::JoinHandle<()>>> = Mutex::new(Option::None);

fn gracefully_shutdown_indexer() {
  if let Some(indexer) = INDEXER.lock().unwrap().take() {
    // Signal the indexer thread to finish the current block and stop.
    SHUTTING_DOWN.store(true, atomic::Ordering::Relaxed);
    log::info!("Waiting for index thread to finish...");
    if indexer.join().is_err() {
      log::warn!("Index thread panicked; join failed");
    }
  }
}

pub fn main() {
  env_logger::init();

  ctrlc::set_handler(move || {
    if SHUTTING_DOWN.fetch_or(true, atomic::Ordering::Relaxed) {
      process::exit(1);
    }

    println!("Shutting down gracefully. Press <CTRL-C> again to shutdown immediately.");

    LISTENERS
      .lock()
      .unwrap()
      .iter()
      .for_each(|handle| handle.graceful_shutdown(Some(Duration::from_millis(100))));
  })
  .expect("Error setting ctrl-c handler");

  if let Err(err) = Arguments::parse().run() {
    eprintln!("error: {err}");
    err
      .chain()
      .skip(1)
      .for_each(|cause| eprintln!("because: {cause}"));
    if env::var_os("RUST_BACKTRACE")
      .map(|val| val == "1")
      .unwrap_or_default()
    {
      eprintln!("{}", err.backtrace());
    }

    gracefully_shutdown_indexer();

    process::exit(1);
  }

  gracefully_shutdown_indexer();
}
