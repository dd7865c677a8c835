#![allow(dead_code)]

pub mod certs;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use blockvoke::backend::{
    AddressInfo, BackendError, BackendResult, BlockRef, BlockTransactions, ChainBackend,
    DecodedTransaction, FundedTransaction, MultisigAddress, OutputKind, OutputSpec, PrevOut,
    PublicKey, SignedTransaction, TxInput, TxOutput, Unspent,
};
use blockvoke::marker::{self, FingerprintPrefix};
use blockvoke::registry::{CertificateRecord, FINGERPRINT_LEN, Fingerprint};
use blockvoke::transaction::canonical_pubkey_order;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use ring::digest;

pub const FUND_FEE_SAT: u64 = 141;
/// Coin `add_owner` gives every owner address.
pub const OWNER_COIN_SAT: u64 = 10_000;

/// Public key of the issuing authority used throughout the tests.
pub fn ca_pubkey() -> PublicKey {
    "03bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"
        .parse()
        .unwrap()
}

pub fn owner_pubkey(seed: u8) -> PublicKey {
    PublicKey::from_bytes([vec![0x02], vec![seed; 32]].concat())
}

pub fn fingerprint_with_prefix(prefix: &str) -> Fingerprint {
    let prefix: FingerprintPrefix = prefix.parse().unwrap();
    let mut bytes = [0u8; FINGERPRINT_LEN];
    bytes[..16].copy_from_slice(prefix.as_bytes());
    Fingerprint::new(bytes)
}

pub fn issued_on() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap()
}

fn txid_of(raw_hex: &str) -> String {
    hex::encode(digest::digest(&digest::SHA256, raw_hex.as_bytes()))
}

fn encode_tx(tx: &DecodedTransaction) -> String {
    hex::encode(serde_json::to_vec(tx).unwrap())
}

fn decode_tx(raw_hex: &str) -> BackendResult<DecodedTransaction> {
    let bytes = hex::decode(raw_hex).map_err(|e| BackendError::Malformed(e.to_string()))?;
    let mut tx: DecodedTransaction =
        serde_json::from_slice(&bytes).map_err(|e| BackendError::Malformed(e.to_string()))?;
    tx.txid = txid_of(raw_hex);
    Ok(tx)
}

/// Derivation used by the fake node; depends on key order like the real one.
pub fn fake_multisig(keys: &[PublicKey]) -> MultisigAddress {
    let joined: Vec<u8> = keys.iter().flat_map(|k| k.as_bytes().to_vec()).collect();
    let hash = hex::encode(digest::digest(&digest::SHA256, &joined));
    MultisigAddress {
        address: format!("2N{}", &hash[..32]),
        redeem_script: format!("51{}52ae", hex::encode(&joined)),
    }
}

/// Address the certificate of `owner` and the test authority embeds.
pub fn multisig_for(owner: &PublicKey) -> String {
    fake_multisig(&canonical_pubkey_order(owner, &ca_pubkey())).address
}

type BroadcastFilter = Box<dyn Fn(&DecodedTransaction) -> bool + Send>;

#[derive(Default)]
struct ChainState {
    blocks: Vec<(DateTime<Utc>, Vec<(String, String)>)>,
    mempool: Vec<(String, String)>,
    labels: HashMap<String, Vec<String>>,
    pubkeys: HashMap<String, PublicKey>,
    unspent: Vec<Unspent>,
    coins_minted: u64,
    broadcasts: Vec<String>,
    /// Txids listed in the pool but gone when fetched.
    vanishing: Vec<String>,
    /// Heights whose block cannot be fetched, as if the node timed out.
    unavailable_heights: HashSet<u64>,
    /// Broadcasts matching the filter time out.
    failing_broadcasts: Option<BroadcastFilter>,
}

/// In-memory node: a wallet, an unconfirmed pool and a chain of blocks.
///
/// Raw transactions are hex encoded JSON of [`DecodedTransaction`]; a txid is
/// the SHA-256 of the raw hex.
pub struct FakeChain {
    state: Mutex<ChainState>,
}

impl FakeChain {
    /// A chain whose tip is at `height`.
    pub fn with_height(height: u64) -> Self {
        let chain = Self {
            state: Mutex::new(ChainState::default()),
        };
        for _ in 0..=height {
            chain.mine();
        }
        chain
    }

    pub fn new() -> Self {
        Self::with_height(0)
    }

    /// A chain of one block holding `tx`.
    pub fn with_genesis(tx: &DecodedTransaction) -> Self {
        let chain = Self {
            state: Mutex::new(ChainState::default()),
        };
        chain.inject(tx);
        chain.mine();
        chain
    }

    pub fn block_time(height: u64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_600_000_000 + height as i64 * 600, 0).unwrap()
    }

    /// Register a wallet address under `label`.
    pub fn add_address(&self, label: &str, address: &str, pubkey: PublicKey) {
        let mut state = self.state.lock().unwrap();
        state
            .labels
            .entry(label.to_string())
            .or_default()
            .push(address.to_string());
        state.pubkeys.insert(address.to_string(), pubkey);
    }

    /// Register the owner wallet address of `subject` and give it one coin of
    /// [`OWNER_COIN_SAT`].
    pub fn add_owner(&self, subject: &str, pubkey: PublicKey) -> String {
        let address = self.add_owner_address(subject, pubkey);
        self.fund_address(&address, OWNER_COIN_SAT);
        address
    }

    /// Register the owner wallet address of `subject` without coins.
    pub fn add_owner_address(&self, subject: &str, pubkey: PublicKey) -> String {
        let address = format!("owner-{subject}");
        self.add_address(&format!("{subject}-coaddress"), &address, pubkey);
        address
    }

    /// Give `address` a new spendable coin.
    pub fn fund_address(&self, address: &str, amount_sat: u64) -> Unspent {
        let mut state = self.state.lock().unwrap();
        state.coins_minted += 1;
        let coin = Unspent {
            txid: format!("coin-{}", state.coins_minted),
            vout: 0,
            address: address.to_string(),
            amount_sat,
        };
        state.unspent.push(coin.clone());
        coin
    }

    /// Coins of `address` not spent yet.
    pub fn coins_of(&self, address: &str) -> Vec<Unspent> {
        let state = self.state.lock().unwrap();
        state
            .unspent
            .iter()
            .filter(|u| u.address == address)
            .cloned()
            .collect()
    }

    pub fn set_unavailable_heights(&self, heights: impl IntoIterator<Item = u64>) {
        self.state.lock().unwrap().unavailable_heights = heights.into_iter().collect();
    }

    /// Make broadcasts of transactions matching `filter` time out.
    pub fn fail_broadcasts_where(
        &self,
        filter: impl Fn(&DecodedTransaction) -> bool + Send + 'static,
    ) {
        self.state.lock().unwrap().failing_broadcasts = Some(Box::new(filter));
    }

    /// Put a transaction straight into the pool, returning its txid.
    pub fn inject(&self, tx: &DecodedTransaction) -> String {
        let raw = encode_tx(tx);
        let txid = txid_of(&raw);
        self.state.lock().unwrap().mempool.push((txid.clone(), raw));
        txid
    }

    pub fn inject_vanishing(&self, txid: &str) {
        self.state.lock().unwrap().vanishing.push(txid.to_string());
    }

    /// Mine the pool into a new block, returning its height.
    pub fn mine(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        let height = state.blocks.len() as u64;
        let transactions = std::mem::take(&mut state.mempool);
        state.blocks.push((Self::block_time(height), transactions));
        height
    }

    pub fn tip(&self) -> u64 {
        self.state.lock().unwrap().blocks.len() as u64 - 1
    }

    pub fn mempool_txids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.mempool.iter().map(|(txid, _)| txid.clone()).collect()
    }

    pub fn broadcasts(&self) -> Vec<String> {
        self.state.lock().unwrap().broadcasts.clone()
    }

    pub fn decode(&self, raw_hex: &str) -> DecodedTransaction {
        decode_tx(raw_hex).unwrap()
    }

    /// Broadcast transactions, decoded, in broadcast order.
    pub fn broadcast_transactions(&self) -> Vec<DecodedTransaction> {
        let state = self.state.lock().unwrap();
        let all: HashMap<&String, &String> = state
            .mempool
            .iter()
            .chain(state.blocks.iter().flat_map(|(_, txs)| txs.iter()))
            .map(|(txid, raw)| (txid, raw))
            .collect();
        state
            .broadcasts
            .iter()
            .filter_map(|txid| all.get(txid).map(|raw| decode_tx(raw).unwrap()))
            .collect()
    }
}

/// A transaction paying `funds_sat` to the owner and carrying one marker.
pub fn marker_transaction(prefix: &str, funds_sat: u64) -> DecodedTransaction {
    let prefix: FingerprintPrefix = prefix.parse().unwrap();
    let payload = marker::encode(prefix, NaiveDate::from_ymd_opt(2021, 3, 1).unwrap(), 0).unwrap();

    DecodedTransaction {
        txid: String::new(),
        inputs: Vec::new(),
        outputs: vec![
            TxOutput {
                vout: 0,
                value_sat: funds_sat,
                script_pubkey: "a914".into(),
                kind: OutputKind::Address("owner".into()),
            },
            TxOutput {
                vout: 1,
                value_sat: 0,
                script_pubkey: "6a1f".into(),
                kind: OutputKind::NullData(payload.to_vec()),
            },
        ],
        fee_sat: Some(170),
    }
}

pub fn funded_record(subject: &str, prefix: &str, owner: &PublicKey) -> CertificateRecord {
    let mut record = CertificateRecord::new(
        subject,
        fingerprint_with_prefix(prefix),
        owner.clone(),
        ca_pubkey(),
        multisig_for(owner),
    )
    .with_generated_at(issued_on());
    record.funded = true;
    record
}

pub fn block(height: u64) -> BlockRef {
    BlockRef {
        height,
        time: FakeChain::block_time(height),
    }
}

fn output_from_spec(vout: u32, spec: &OutputSpec) -> TxOutput {
    match spec {
        OutputSpec::Address {
            address,
            amount_sat,
        } => TxOutput {
            vout,
            value_sat: *amount_sat,
            script_pubkey: format!("a914{}", hex::encode(address)),
            kind: OutputKind::Address(address.clone()),
        },
        OutputSpec::Data(data) => TxOutput {
            vout,
            value_sat: 0,
            script_pubkey: format!("6a{}", hex::encode(data)),
            kind: OutputKind::NullData(data.clone()),
        },
    }
}

#[async_trait]
impl ChainBackend for FakeChain {
    async fn chain_height(&self) -> BackendResult<u64> {
        Ok(self.tip())
    }

    async fn block_hash(&self, height: u64) -> BackendResult<String> {
        if self.state.lock().unwrap().unavailable_heights.contains(&height) {
            return Err(BackendError::Timeout);
        }
        if height > self.tip() {
            return Err(BackendError::NotFound(format!("block {height}")));
        }
        Ok(format!("block-{height}"))
    }

    async fn block_transactions(&self, hash: &str) -> BackendResult<BlockTransactions> {
        let height: usize = hash
            .strip_prefix("block-")
            .and_then(|h| h.parse().ok())
            .ok_or_else(|| BackendError::NotFound(hash.to_string()))?;
        let state = self.state.lock().unwrap();
        let (time, txs) = state
            .blocks
            .get(height)
            .ok_or_else(|| BackendError::NotFound(hash.to_string()))?;

        Ok(BlockTransactions {
            hash: hash.to_string(),
            time: *time,
            transactions: txs
                .iter()
                .map(|(_, raw)| decode_tx(raw))
                .collect::<BackendResult<_>>()?,
        })
    }

    async fn raw_mempool_txids(&self) -> BackendResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut txids: Vec<String> = state.mempool.iter().map(|(txid, _)| txid.clone()).collect();
        txids.extend(state.vanishing.iter().cloned());
        Ok(txids)
    }

    async fn raw_transaction(&self, txid: &str) -> BackendResult<String> {
        let state = self.state.lock().unwrap();
        state
            .mempool
            .iter()
            .find(|(id, _)| id == txid)
            .map(|(_, raw)| raw.clone())
            .ok_or_else(|| BackendError::NotFound(txid.to_string()))
    }

    async fn decode_transaction(&self, raw_hex: &str) -> BackendResult<DecodedTransaction> {
        decode_tx(raw_hex)
    }

    async fn create_transaction(
        &self,
        inputs: &[TxInput],
        outputs: &[OutputSpec],
    ) -> BackendResult<String> {
        let tx = DecodedTransaction {
            txid: String::new(),
            inputs: inputs.to_vec(),
            outputs: outputs
                .iter()
                .enumerate()
                .map(|(i, spec)| output_from_spec(i as u32, spec))
                .collect(),
            fee_sat: None,
        };
        Ok(encode_tx(&tx))
    }

    async fn list_unspent(&self, addresses: &[String]) -> BackendResult<Vec<Unspent>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .unspent
            .iter()
            .filter(|u| addresses.contains(&u.address))
            .cloned()
            .collect())
    }

    async fn fund_transaction(
        &self,
        raw_hex: &str,
        change_address: &str,
        _fee_rate_sat_vb: u64,
    ) -> BackendResult<FundedTransaction> {
        let mut tx = decode_tx(raw_hex)?;
        let state = self.state.lock().unwrap();

        let mut available = 0u64;
        for input in &tx.inputs {
            let coin = state
                .unspent
                .iter()
                .find(|u| u.txid == input.txid && u.vout == input.vout)
                .ok_or_else(|| BackendError::NotFound(format!("{}:{}", input.txid, input.vout)))?;
            available += coin.amount_sat;
        }
        let needed = tx.outputs.iter().map(|o| o.value_sat).sum::<u64>() + FUND_FEE_SAT;
        if available < needed {
            return Err(BackendError::InsufficientFunds(format!(
                "Insufficient funds: {available} < {needed}"
            )));
        }

        if available > needed {
            let vout = tx.outputs.len() as u32;
            tx.outputs.push(output_from_spec(
                vout,
                &OutputSpec::Address {
                    address: change_address.to_string(),
                    amount_sat: available - needed,
                },
            ));
        }
        tx.fee_sat = Some(FUND_FEE_SAT);
        tx.txid = String::new();

        Ok(FundedTransaction {
            hex: encode_tx(&tx),
            fee_sat: FUND_FEE_SAT,
        })
    }

    /// A wallet coin can only be signed for with the key of its address.
    async fn sign_transaction(
        &self,
        raw_hex: &str,
        signing_addresses: &[String],
        _prevouts: &[PrevOut],
    ) -> BackendResult<SignedTransaction> {
        let tx = decode_tx(raw_hex)?;
        let state = self.state.lock().unwrap();
        if let Some(unknown) = signing_addresses
            .iter()
            .find(|a| !state.pubkeys.contains_key(*a))
        {
            return Err(BackendError::Signing(format!("no key for {unknown}")));
        }

        let complete = tx.inputs.iter().all(|input| {
            state
                .unspent
                .iter()
                .find(|u| u.txid == input.txid && u.vout == input.vout)
                .is_none_or(|coin| signing_addresses.contains(&coin.address))
        });

        Ok(SignedTransaction {
            hex: raw_hex.to_string(),
            complete,
        })
    }

    async fn broadcast_transaction(&self, signed_hex: &str) -> BackendResult<String> {
        let tx = decode_tx(signed_hex)?;
        let mut state = self.state.lock().unwrap();
        if state.failing_broadcasts.as_ref().is_some_and(|fails| fails(&tx)) {
            return Err(BackendError::Timeout);
        }

        state
            .unspent
            .retain(|u| !tx.inputs.iter().any(|i| i.txid == u.txid && i.vout == u.vout));
        for output in &tx.outputs {
            let OutputKind::Address(address) = &output.kind else {
                continue;
            };
            if state.pubkeys.contains_key(address) {
                state.unspent.push(Unspent {
                    txid: tx.txid.clone(),
                    vout: output.vout,
                    address: address.clone(),
                    amount_sat: output.value_sat,
                });
            }
        }

        state.mempool.push((tx.txid.clone(), signed_hex.to_string()));
        state.broadcasts.push(tx.txid.clone());
        Ok(tx.txid)
    }

    async fn derive_multisig_address(
        &self,
        threshold: u8,
        pubkeys: &[PublicKey],
    ) -> BackendResult<MultisigAddress> {
        if threshold != 1 || pubkeys.len() != 2 {
            return Err(BackendError::Rpc {
                code: -8,
                message: "unsupported multisig".into(),
            });
        }
        Ok(fake_multisig(pubkeys))
    }

    async fn addresses_by_label(&self, label: &str) -> BackendResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state.labels.get(label).cloned().unwrap_or_default())
    }

    async fn address_info(&self, address: &str) -> BackendResult<AddressInfo> {
        let state = self.state.lock().unwrap();
        Ok(AddressInfo {
            address: address.to_string(),
            pubkey: state.pubkeys.get(address).cloned(),
        })
    }
}
