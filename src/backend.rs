//! Interface to the blockchain node that stores, signs and relays transactions.
//!
//! Everything the revocation engine needs from the ledger goes through
//! [`ChainBackend`]. Implementations must be safe to call concurrently from the
//! orchestrator and both watchers.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod rpc;

pub use rpc::{BitcoindRpc, RpcConfig};

pub type BackendResult<T> = Result<T, BackendError>;

/// Errors raised by a blockchain backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Timeout while waiting for the node")]
    Timeout,

    #[error("Node returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Malformed node response: {0}")]
    Malformed(String),

    #[error("Invalid backend URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl BackendError {
    /// Whether the node could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Timeout)
    }
}

/// A compressed or uncompressed secp256k1 public key, kept as raw bytes.
///
/// Ordering is plain byte order, which is what canonical multisig derivation
/// sorts by.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl FromStr for PublicKey {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())?;
        if bytes.is_empty() {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for PublicKey {
    type Error = hex::FromHexError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PublicKey> for String {
    fn from(value: PublicKey) -> Self {
        value.to_hex()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

/// Position of a confirmed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub height: u64,
    pub time: DateTime<Utc>,
}

/// What an output script pays to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputKind {
    /// `OP_RETURN` output, with the first pushed payload.
    NullData(Vec<u8>),
    /// Standard output paying to an address.
    Address(String),
    /// Anything else.
    NonStandard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub vout: u32,
    pub value_sat: u64,
    pub script_pubkey: String,
    pub kind: OutputKind,
}

impl TxOutput {
    pub fn null_data(&self) -> Option<&[u8]> {
        match &self.kind {
            OutputKind::NullData(data) => Some(data),
            _ => None,
        }
    }

    pub fn pays_to(&self, address: &str) -> bool {
        matches!(&self.kind, OutputKind::Address(a) if a == address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedTransaction {
    pub txid: String,
    /// Outpoints spent. Coinbase inputs are left out.
    #[serde(default)]
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Fee paid, when the node can tell.
    pub fee_sat: Option<u64>,
}

impl DecodedTransaction {
    /// Value of every output that is not null-data.
    pub fn spendable_value_sat(&self) -> u64 {
        self.outputs
            .iter()
            .filter(|o| o.null_data().is_none())
            .map(|o| o.value_sat)
            .sum()
    }
}

/// Transactions of one block, in block order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTransactions {
    pub hash: String,
    pub time: DateTime<Utc>,
    pub transactions: Vec<DecodedTransaction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub txid: String,
    pub vout: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputSpec {
    Address { address: String, amount_sat: u64 },
    Data(Vec<u8>),
}

/// Metadata about an output being spent that the signer cannot look up itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrevOut {
    pub txid: String,
    pub vout: u32,
    pub script_pubkey: String,
    pub redeem_script: Option<String>,
    pub amount_sat: u64,
}

/// A wallet output that can be spent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unspent {
    pub txid: String,
    pub vout: u32,
    pub address: String,
    pub amount_sat: u64,
}

impl Unspent {
    pub fn outpoint(&self) -> TxInput {
        TxInput {
            txid: self.txid.clone(),
            vout: self.vout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundedTransaction {
    pub hex: String,
    pub fee_sat: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub hex: String,
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigAddress {
    pub address: String,
    pub redeem_script: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressInfo {
    pub address: String,
    pub pubkey: Option<PublicKey>,
}

/// Abstract blockchain node.
#[async_trait]
pub trait ChainBackend: Send + Sync + 'static {
    /// Height of the current chain tip.
    async fn chain_height(&self) -> BackendResult<u64>;

    async fn block_hash(&self, height: u64) -> BackendResult<String>;

    async fn block_transactions(&self, hash: &str) -> BackendResult<BlockTransactions>;

    /// Transaction ids currently in the unconfirmed pool.
    async fn raw_mempool_txids(&self) -> BackendResult<Vec<String>>;

    /// Raw hex of a transaction. `NotFound` once it has left the pool.
    async fn raw_transaction(&self, txid: &str) -> BackendResult<String>;

    async fn decode_transaction(&self, raw_hex: &str) -> BackendResult<DecodedTransaction>;

    async fn create_transaction(
        &self,
        inputs: &[TxInput],
        outputs: &[OutputSpec],
    ) -> BackendResult<String>;

    /// Spendable outputs, confirmed or not, paying to one of `addresses`.
    async fn list_unspent(&self, addresses: &[String]) -> BackendResult<Vec<Unspent>>;

    /// Add the fee and a change output. Only the inputs already present are
    /// spent; the wallet never adds coins of its own choosing.
    async fn fund_transaction(
        &self,
        raw_hex: &str,
        change_address: &str,
        fee_rate_sat_vb: u64,
    ) -> BackendResult<FundedTransaction>;

    /// Sign with the keys behind `signing_addresses`.
    async fn sign_transaction(
        &self,
        raw_hex: &str,
        signing_addresses: &[String],
        prevouts: &[PrevOut],
    ) -> BackendResult<SignedTransaction>;

    /// Relay a signed transaction, returning its id.
    async fn broadcast_transaction(&self, signed_hex: &str) -> BackendResult<String>;

    async fn derive_multisig_address(
        &self,
        threshold: u8,
        pubkeys: &[PublicKey],
    ) -> BackendResult<MultisigAddress>;

    async fn addresses_by_label(&self, label: &str) -> BackendResult<Vec<String>>;

    async fn address_info(&self, address: &str) -> BackendResult<AddressInfo>;
}

/// First wallet address carrying `label`.
pub async fn first_address_by_label(
    backend: &dyn ChainBackend,
    label: &str,
) -> BackendResult<String> {
    backend
        .addresses_by_label(label)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::NotFound(format!("no address labelled `{label}`")))
}

// Size estimates for legacy P2PKH spends
const TX_OVERHEAD_VBYTES: u64 = 11;
const INPUT_VBYTES: u64 = 148;
const OUTPUT_VBYTES: u64 = 34;

/// Largest-first selection of outputs covering `amount_sat` plus the fee of a
/// transaction with `outputs` outputs and a change output.
///
/// Returns `None` when all of `unspent` together fall short.
pub fn select_unspent(
    mut unspent: Vec<Unspent>,
    amount_sat: u64,
    outputs: usize,
    fee_rate_sat_vb: u64,
) -> Option<Vec<Unspent>> {
    unspent.sort_by(|a, b| b.amount_sat.cmp(&a.amount_sat));

    let fixed_vbytes = TX_OVERHEAD_VBYTES + OUTPUT_VBYTES * (outputs as u64 + 1);
    let mut selected = Vec::new();
    let mut total = 0u64;
    for coin in unspent {
        total = total.saturating_add(coin.amount_sat);
        selected.push(coin);

        let vbytes = fixed_vbytes + INPUT_VBYTES * selected.len() as u64;
        let needed = amount_sat.saturating_add(fee_rate_sat_vb.saturating_mul(vbytes));
        if total >= needed {
            return Some(selected);
        }
    }
    None
}

/// Inputs from the coins of `address` alone that pay for `amount_sat` across
/// `outputs` outputs.
pub async fn inputs_from_address(
    backend: &dyn ChainBackend,
    address: &str,
    amount_sat: u64,
    outputs: usize,
    fee_rate_sat_vb: u64,
) -> BackendResult<Vec<TxInput>> {
    let unspent = backend.list_unspent(&[address.to_string()]).await?;
    let available: u64 = unspent.iter().map(|u| u.amount_sat).sum();

    select_unspent(unspent, amount_sat, outputs, fee_rate_sat_vb)
        .map(|coins| coins.iter().map(Unspent::outpoint).collect())
        .ok_or_else(|| {
            BackendError::InsufficientFunds(format!(
                "{address} holds {available} sat, {amount_sat} sat plus fee needed"
            ))
        })
}

/// Extract the first data push of an `OP_RETURN` script.
///
/// Returns `None` when the script is not null-data. A bare `OP_RETURN` yields
/// an empty payload.
pub fn parse_null_data(script: &[u8]) -> Option<Vec<u8>> {
    const OP_RETURN: u8 = 0x6a;
    const OP_PUSHDATA1: u8 = 0x4c;
    const OP_PUSHDATA2: u8 = 0x4d;
    const OP_PUSHDATA4: u8 = 0x4e;

    let (&op, rest) = script.split_first()?;
    if op != OP_RETURN {
        return None;
    }
    let Some((&push, rest)) = rest.split_first() else {
        return Some(Vec::new());
    };

    let (len, rest) = match push {
        0x00 => (0, rest),
        0x01..=0x4b => (push as usize, rest),
        OP_PUSHDATA1 => {
            let (&len, rest) = rest.split_first()?;
            (len as usize, rest)
        }
        OP_PUSHDATA2 => {
            let len = u16::from_le_bytes(rest.get(..2)?.try_into().ok()?);
            (len as usize, &rest[2..])
        }
        OP_PUSHDATA4 => {
            let len = u32::from_le_bytes(rest.get(..4)?.try_into().ok()?);
            (usize::try_from(len).ok()?, &rest[4..])
        }
        // Not a push, the script carries no data we understand
        _ => return Some(Vec::new()),
    };

    rest.get(..len).map(<[u8]>::to_vec)
}
