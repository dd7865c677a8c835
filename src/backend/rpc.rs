use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tokio::time::timeout;
use tracing::{debug, trace};
use url::Url;
use uuid::Uuid;

use super::{
    AddressInfo, BackendError, BackendResult, BlockTransactions, ChainBackend, DecodedTransaction,
    FundedTransaction, MultisigAddress, OutputKind, OutputSpec, PrevOut, PublicKey,
    SignedTransaction, TxInput, TxOutput, Unspent, parse_null_data,
};

const SATS_PER_BTC: u64 = 100_000_000;

// bitcoind RPC error codes
const RPC_WALLET_ERROR: i64 = -4;
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
const RPC_WALLET_INSUFFICIENT_FUNDS: i64 = -6;
const RPC_WALLET_INVALID_LABEL_NAME: i64 = -11;

fn default_timeout_secs() -> u64 {
    30
}

/// Connection settings for a bitcoind JSON-RPC endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    pub url: String,
    pub user: String,
    pub password: SecretString,
    /// Wallet to address, appended as `/wallet/<name>`.
    #[serde(default)]
    pub wallet: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// [`ChainBackend`] backed by a bitcoind node.
#[derive(Debug, Clone)]
pub struct BitcoindRpc {
    client: Client,
    endpoint: Url,
    user: String,
    password: SecretString,
    request_timeout: Duration,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RawTransaction {
    txid: String,
    #[serde(default)]
    vin: Vec<RawInput>,
    vout: Vec<RawOutput>,
    #[serde(default)]
    fee: Option<f64>,
}

/// Coinbase inputs carry neither `txid` nor `vout`.
#[derive(Deserialize)]
struct RawInput {
    #[serde(default)]
    txid: Option<String>,
    #[serde(default)]
    vout: Option<u32>,
}

#[derive(Deserialize)]
struct RawUnspent {
    txid: String,
    vout: u32,
    #[serde(default)]
    address: String,
    amount: f64,
}

#[derive(Deserialize)]
struct RawOutput {
    value: f64,
    n: u32,
    #[serde(rename = "scriptPubKey")]
    script_pubkey: RawScript,
}

#[derive(Deserialize)]
struct RawScript {
    hex: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    addresses: Vec<String>,
}

#[derive(Deserialize)]
struct RawBlock {
    hash: String,
    time: i64,
    tx: Vec<RawTransaction>,
}

#[derive(Deserialize)]
struct RawFunded {
    hex: String,
    fee: f64,
}

#[derive(Deserialize)]
struct RawSigned {
    hex: String,
    complete: bool,
}

#[derive(Deserialize)]
struct RawMultisig {
    address: String,
    #[serde(rename = "redeemScript")]
    redeem_script: String,
}

#[derive(Deserialize)]
struct RawAddressInfo {
    address: String,
    #[serde(default)]
    pubkey: Option<String>,
}

impl BitcoindRpc {
    /// Returns an error if the HTTP client cannot be initialized or the URL is invalid
    pub fn new(config: &RpcConfig) -> BackendResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint_url(&config.url, config.wallet.as_deref())?,
            user: config.user.clone(),
            password: config.password.clone(),
            request_timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> BackendResult<T> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": Uuid::new_v4().to_string(),
            "method": method,
            "params": params,
        });
        trace!(method, "Calling node");

        let request = self
            .client
            .post(self.endpoint.clone())
            .basic_auth(&self.user, Some(self.password.expose_secret()))
            .json(&body)
            .send();

        let response = match timeout(self.request_timeout, request).await {
            Ok(result) => result?,
            Err(_) => return Err(BackendError::Timeout),
        };

        // bitcoind reports RPC errors as 404/500 with a JSON body
        let status = response.status();
        if !status.is_success()
            && status != StatusCode::INTERNAL_SERVER_ERROR
            && status != StatusCode::NOT_FOUND
        {
            return Err(BackendError::Malformed(format!(
                "HTTP error {status} calling {method}"
            )));
        }

        let envelope: RpcResponse = response.json().await?;
        if let Some(error) = envelope.error {
            debug!(method, code = error.code, "Node returned an error: {}", error.message);
            return Err(classify_error(error.code, error.message));
        }

        serde_json::from_value(envelope.result.unwrap_or(Value::Null))
            .map_err(|e| BackendError::Malformed(format!("{method}: {e}")))
    }
}

fn endpoint_url(base: &str, wallet: Option<&str>) -> BackendResult<Url> {
    let url = Url::parse(base)?;
    match wallet {
        Some(name) => Ok(url.join(&format!("/wallet/{}", urlencoding::encode(name)))?),
        None => Ok(url),
    }
}

fn classify_error(code: i64, message: String) -> BackendError {
    match code {
        RPC_WALLET_INSUFFICIENT_FUNDS => BackendError::InsufficientFunds(message),
        RPC_WALLET_ERROR if message.contains("Insufficient funds") => {
            BackendError::InsufficientFunds(message)
        }
        RPC_INVALID_ADDRESS_OR_KEY => BackendError::NotFound(message),
        _ => BackendError::Rpc { code, message },
    }
}

/// Format satoshis as an exact BTC decimal string.
pub(crate) fn format_btc(sat: u64) -> String {
    format!("{}.{:08}", sat / SATS_PER_BTC, sat % SATS_PER_BTC)
}

pub(crate) fn btc_to_sat(btc: f64) -> u64 {
    // Saturates at zero for negative values
    (btc * SATS_PER_BTC as f64).round() as u64
}

impl From<RawTransaction> for DecodedTransaction {
    fn from(raw: RawTransaction) -> Self {
        let outputs = raw
            .vout
            .into_iter()
            .map(|out| {
                let kind = output_kind(&out.script_pubkey);
                TxOutput {
                    vout: out.n,
                    value_sat: btc_to_sat(out.value),
                    script_pubkey: out.script_pubkey.hex,
                    kind,
                }
            })
            .collect();

        let inputs = raw
            .vin
            .into_iter()
            .filter_map(|input| {
                Some(TxInput {
                    txid: input.txid?,
                    vout: input.vout?,
                })
            })
            .collect();

        Self {
            txid: raw.txid,
            inputs,
            outputs,
            fee_sat: raw.fee.map(btc_to_sat),
        }
    }
}

fn output_kind(script: &RawScript) -> OutputKind {
    if script.kind == "nulldata" {
        return hex::decode(&script.hex)
            .ok()
            .and_then(|bytes| parse_null_data(&bytes))
            .map(OutputKind::NullData)
            .unwrap_or(OutputKind::NonStandard);
    }

    script
        .address
        .clone()
        .or_else(|| script.addresses.first().cloned())
        .map(OutputKind::Address)
        .unwrap_or(OutputKind::NonStandard)
}

fn outputs_to_json(outputs: &[OutputSpec]) -> Value {
    outputs
        .iter()
        .map(|output| match output {
            OutputSpec::Address {
                address,
                amount_sat,
            } => json!({ address.as_str(): format_btc(*amount_sat) }),
            OutputSpec::Data(data) => json!({ "data": hex::encode(data) }),
        })
        .collect()
}

fn prevouts_to_json(prevouts: &[PrevOut]) -> Value {
    prevouts
        .iter()
        .map(|prev| {
            let mut entry = json!({
                "txid": prev.txid,
                "vout": prev.vout,
                "scriptPubKey": prev.script_pubkey,
                "amount": format_btc(prev.amount_sat),
            });
            if let (Some(redeem), Some(map)) = (&prev.redeem_script, entry.as_object_mut()) {
                map.insert("redeemScript".into(), json!(redeem));
            }
            entry
        })
        .collect()
}

#[async_trait]
impl ChainBackend for BitcoindRpc {
    async fn chain_height(&self) -> BackendResult<u64> {
        self.call("getblockcount", json!([])).await
    }

    async fn block_hash(&self, height: u64) -> BackendResult<String> {
        self.call("getblockhash", json!([height])).await
    }

    async fn block_transactions(&self, hash: &str) -> BackendResult<BlockTransactions> {
        let block: RawBlock = self.call("getblock", json!([hash, 2])).await?;
        let time = DateTime::from_timestamp(block.time, 0)
            .ok_or_else(|| BackendError::Malformed(format!("block time {}", block.time)))?;

        Ok(BlockTransactions {
            hash: block.hash,
            time,
            transactions: block.tx.into_iter().map(Into::into).collect(),
        })
    }

    async fn raw_mempool_txids(&self) -> BackendResult<Vec<String>> {
        self.call("getrawmempool", json!([])).await
    }

    async fn raw_transaction(&self, txid: &str) -> BackendResult<String> {
        self.call("getrawtransaction", json!([txid])).await
    }

    async fn decode_transaction(&self, raw_hex: &str) -> BackendResult<DecodedTransaction> {
        let raw: RawTransaction = self.call("decoderawtransaction", json!([raw_hex])).await?;
        Ok(raw.into())
    }

    async fn create_transaction(
        &self,
        inputs: &[TxInput],
        outputs: &[OutputSpec],
    ) -> BackendResult<String> {
        let inputs: Vec<Value> = inputs
            .iter()
            .map(|i| json!({ "txid": i.txid, "vout": i.vout }))
            .collect();
        self.call("createrawtransaction", json!([inputs, outputs_to_json(outputs)]))
            .await
    }

    async fn list_unspent(&self, addresses: &[String]) -> BackendResult<Vec<Unspent>> {
        let unspent: Vec<RawUnspent> = self
            .call("listunspent", json!([0, 9_999_999, addresses]))
            .await?;

        Ok(unspent
            .into_iter()
            .map(|u| Unspent {
                txid: u.txid,
                vout: u.vout,
                address: u.address,
                amount_sat: btc_to_sat(u.amount),
            })
            .collect())
    }

    async fn fund_transaction(
        &self,
        raw_hex: &str,
        change_address: &str,
        fee_rate_sat_vb: u64,
    ) -> BackendResult<FundedTransaction> {
        let options = json!({
            "changeAddress": change_address,
            "fee_rate": fee_rate_sat_vb,
            "add_inputs": false,
        });
        let funded: RawFunded = self
            .call("fundrawtransaction", json!([raw_hex, options]))
            .await?;

        Ok(FundedTransaction {
            hex: funded.hex,
            fee_sat: btc_to_sat(funded.fee),
        })
    }

    async fn sign_transaction(
        &self,
        raw_hex: &str,
        signing_addresses: &[String],
        prevouts: &[PrevOut],
    ) -> BackendResult<SignedTransaction> {
        let mut keys = Vec::with_capacity(signing_addresses.len());
        for address in signing_addresses {
            let key: String = self
                .call("dumpprivkey", json!([address]))
                .await
                .map_err(|e| match e {
                    BackendError::Rpc { message, .. } | BackendError::NotFound(message) => {
                        BackendError::Signing(format!("no key for {address}: {message}"))
                    }
                    other => other,
                })?;
            keys.push(key);
        }

        let signed: RawSigned = self
            .call(
                "signrawtransactionwithkey",
                json!([raw_hex, keys, prevouts_to_json(prevouts)]),
            )
            .await?;

        Ok(SignedTransaction {
            hex: signed.hex,
            complete: signed.complete,
        })
    }

    async fn broadcast_transaction(&self, signed_hex: &str) -> BackendResult<String> {
        self.call("sendrawtransaction", json!([signed_hex])).await
    }

    async fn derive_multisig_address(
        &self,
        threshold: u8,
        pubkeys: &[PublicKey],
    ) -> BackendResult<MultisigAddress> {
        let keys: Vec<String> = pubkeys.iter().map(PublicKey::to_hex).collect();
        let multisig: RawMultisig = self
            .call("createmultisig", json!([threshold, keys, "legacy"]))
            .await?;

        Ok(MultisigAddress {
            address: multisig.address,
            redeem_script: multisig.redeem_script,
        })
    }

    async fn addresses_by_label(&self, label: &str) -> BackendResult<Vec<String>> {
        match self
            .call::<Map<String, Value>>("getaddressesbylabel", json!([label]))
            .await
        {
            Ok(addresses) => Ok(addresses.into_iter().map(|(address, _)| address).collect()),
            Err(BackendError::Rpc { code, .. }) if code == RPC_WALLET_INVALID_LABEL_NAME => {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn address_info(&self, address: &str) -> BackendResult<AddressInfo> {
        let info: RawAddressInfo = self.call("getaddressinfo", json!([address])).await?;
        let pubkey = info
            .pubkey
            .map(|hex| hex.parse::<PublicKey>())
            .transpose()
            .map_err(|e| BackendError::Malformed(format!("pubkey of {address}: {e}")))?;

        Ok(AddressInfo {
            address: info.address,
            pubkey,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_btc() {
        assert_eq!(format_btc(477), "0.00000477");
        assert_eq!(format_btc(150_000_000), "1.50000000");
        assert_eq!(format_btc(0), "0.00000000");
    }

    #[test]
    fn test_btc_to_sat() {
        assert_eq!(btc_to_sat(0.00000477), 477);
        assert_eq!(btc_to_sat(0.1), 10_000_000);
        assert_eq!(btc_to_sat(-1.0), 0);
    }

    #[test]
    fn test_endpoint_with_wallet() {
        let url = endpoint_url("http://127.0.0.1:18443", Some("a.example")).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:18443/wallet/a.example");

        let url = endpoint_url("http://127.0.0.1:18443/", None).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:18443/");

        assert!(endpoint_url("not a url", None).is_err());
    }

    #[test]
    fn test_classify_error() {
        assert!(matches!(
            classify_error(-6, "Insufficient funds".into()),
            BackendError::InsufficientFunds(_)
        ));
        assert!(matches!(
            classify_error(-4, "Insufficient funds".into()),
            BackendError::InsufficientFunds(_)
        ));
        assert!(matches!(
            classify_error(-5, "No such mempool or blockchain transaction".into()),
            BackendError::NotFound(_)
        ));
        assert!(matches!(
            classify_error(-8, "bad".into()),
            BackendError::Rpc { code: -8, .. }
        ));
    }

    #[test]
    fn test_decoded_transaction_from_node_json() {
        let raw: RawTransaction = serde_json::from_value(json!({
            "txid": "abc",
            "vin": [
                { "coinbase": "03a0860100", "sequence": 4294967295u32 },
                { "txid": "f1", "vout": 1, "sequence": 4294967295u32 }
            ],
            "vout": [
                {
                    "value": 0.00000307,
                    "n": 0,
                    "scriptPubKey": {
                        "asm": "OP_DUP OP_HASH160 00 OP_EQUALVERIFY OP_CHECKSIG",
                        "hex": "76a914000000000000000000000000000000000000000088ac",
                        "type": "pubkeyhash",
                        "address": "mfWxJ45yp2SFn7UciZyNpvDKrzbhyfKrY8"
                    }
                },
                {
                    "value": 0.0,
                    "n": 1,
                    "scriptPubKey": {
                        "asm": "OP_RETURN 0102",
                        "hex": "6a020102",
                        "type": "nulldata"
                    }
                },
                {
                    "value": 0.0,
                    "n": 2,
                    "scriptPubKey": { "hex": "51", "type": "nonstandard" }
                }
            ]
        }))
        .unwrap();

        let tx = DecodedTransaction::from(raw);
        assert_eq!(tx.txid, "abc");
        assert_eq!(
            tx.inputs,
            [TxInput {
                txid: "f1".into(),
                vout: 1
            }]
        );
        assert_eq!(tx.fee_sat, None);
        assert_eq!(tx.outputs[0].value_sat, 307);
        assert!(tx.outputs[0].pays_to("mfWxJ45yp2SFn7UciZyNpvDKrzbhyfKrY8"));
        assert_eq!(tx.outputs[1].null_data(), Some([1u8, 2].as_slice()));
        assert_eq!(tx.outputs[2].kind, OutputKind::NonStandard);
    }

    #[test]
    fn test_outputs_json_keeps_order() {
        let json = outputs_to_json(&[
            OutputSpec::Address {
                address: "owner".into(),
                amount_sat: 307,
            },
            OutputSpec::Data(vec![0xab]),
        ]);
        assert_eq!(json, json!([{ "owner": "0.00000307" }, { "data": "ab" }]));
    }

    #[test]
    fn test_prevouts_json_includes_redeem_script() {
        let json = prevouts_to_json(&[PrevOut {
            txid: "f1".into(),
            vout: 0,
            script_pubkey: "a914".into(),
            redeem_script: Some("5121".into()),
            amount_sat: 477,
        }]);
        assert_eq!(json[0]["redeemScript"], "5121");
        assert_eq!(json[0]["amount"], "0.00000477");
    }
}
