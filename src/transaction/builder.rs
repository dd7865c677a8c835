use std::sync::Arc;

use tracing::debug;

use crate::backend::{ChainBackend, OutputSpec, PrevOut, PublicKey, TxInput, inputs_from_address};
use crate::marker::Marker;

use super::{PairError, PairParams, PairResult, RevocationRequest, SignedTx, TransactionPair};

/// Sort two keys by raw bytes, the order the multisig address is derived in.
pub fn canonical_pubkey_order(a: &PublicKey, b: &PublicKey) -> [PublicKey; 2] {
    if a.as_bytes() <= b.as_bytes() {
        [a.clone(), b.clone()]
    } else {
        [b.clone(), a.clone()]
    }
}

/// Builds and signs revocation transaction pairs through a [`ChainBackend`].
#[derive(Clone)]
pub struct TransactionPairBuilder {
    backend: Arc<dyn ChainBackend>,
    params: PairParams,
}

impl TransactionPairBuilder {
    pub fn new(backend: Arc<dyn ChainBackend>, params: PairParams) -> PairResult<Self> {
        params.validate()?;
        Ok(Self { backend, params })
    }

    pub fn params(&self) -> &PairParams {
        &self.params
    }

    /// Build both signed transactions. Fails before anything is created if the
    /// owner address does not hold the certificate's owner key, or if the
    /// certificate's multisig address cannot be reproduced from the owner and
    /// counterparty keys.
    ///
    /// The fund transaction spends coins of the owner address only.
    pub async fn build(&self, request: &RevocationRequest) -> PairResult<TransactionPair> {
        let owner_pubkey = self
            .backend
            .address_info(&request.owner_address)
            .await?
            .pubkey
            .ok_or_else(|| PairError::MissingOwnerKey(request.owner_address.clone()))?;
        if owner_pubkey != request.owner_pubkey {
            return Err(PairError::OwnerKeyMismatch {
                address: request.owner_address.clone(),
                expected: request.owner_pubkey.clone(),
                found: owner_pubkey,
            });
        }

        let keys = canonical_pubkey_order(&owner_pubkey, &request.counterparty_pubkey);
        let multisig = self.backend.derive_multisig_address(1, &keys).await?;
        if multisig.address != request.expected_multisig {
            return Err(PairError::ProtocolViolation {
                expected: request.expected_multisig.clone(),
                derived: multisig.address,
            });
        }

        let marker = Marker::new(
            request.fingerprint_prefix,
            request.issued_on,
            request.reason_code,
        )?;
        let signers = [request.owner_address.clone()];

        // Fund: owner coins -> multisig, change back to the owner
        let inputs = inputs_from_address(
            self.backend.as_ref(),
            &request.owner_address,
            self.params.fund_amount_sat,
            1,
            self.params.fee_rate_sat_vb,
        )
        .await?;
        let raw = self
            .backend
            .create_transaction(
                &inputs,
                &[OutputSpec::Address {
                    address: multisig.address.clone(),
                    amount_sat: self.params.fund_amount_sat,
                }],
            )
            .await?;
        let funded = self
            .backend
            .fund_transaction(&raw, &request.owner_address, self.params.fee_rate_sat_vb)
            .await?;
        let signed = self
            .backend
            .sign_transaction(&funded.hex, &signers, &[])
            .await?;
        if !signed.complete {
            return Err(PairError::IncompleteSignature("fund"));
        }

        let fund_tx = self.backend.decode_transaction(&signed.hex).await?;
        let fund_output = fund_tx
            .outputs
            .iter()
            .find(|o| o.pays_to(&multisig.address))
            .ok_or_else(|| PairError::MissingFundOutput {
                txid: fund_tx.txid.clone(),
            })?;
        debug!(
            subject = %request.subject,
            txid = %fund_tx.txid,
            vout = fund_output.vout,
            fee_sat = funded.fee_sat,
            "Fund transaction signed"
        );

        let remainder = fund_output
            .value_sat
            .checked_sub(self.params.revoke_fee_sat)
            .filter(|v| *v > self.params.dust_threshold_sat)
            .ok_or_else(|| {
                PairError::InvalidParams(format!(
                    "multisig output of {} sat cannot pay the revoke fee",
                    fund_output.value_sat
                ))
            })?;

        // Revoke: multisig -> owner, plus the marker
        let prevout = PrevOut {
            txid: fund_tx.txid.clone(),
            vout: fund_output.vout,
            script_pubkey: fund_output.script_pubkey.clone(),
            redeem_script: Some(multisig.redeem_script.clone()),
            amount_sat: fund_output.value_sat,
        };
        let raw = self
            .backend
            .create_transaction(
                &[TxInput {
                    txid: prevout.txid.clone(),
                    vout: prevout.vout,
                }],
                &[
                    OutputSpec::Address {
                        address: request.owner_address.clone(),
                        amount_sat: remainder,
                    },
                    OutputSpec::Data(marker.to_bytes().to_vec()),
                ],
            )
            .await?;
        let signed_revoke = self
            .backend
            .sign_transaction(&raw, &signers, std::slice::from_ref(&prevout))
            .await?;
        if !signed_revoke.complete {
            return Err(PairError::IncompleteSignature("revoke"));
        }
        let revoke_tx = self.backend.decode_transaction(&signed_revoke.hex).await?;
        debug!(subject = %request.subject, txid = %revoke_tx.txid, "Revoke transaction signed");

        Ok(TransactionPair {
            fund: SignedTx {
                txid: fund_tx.txid,
                hex: signed.hex,
            },
            revoke: SignedTx {
                txid: revoke_tx.txid,
                hex: signed_revoke.hex,
            },
            multisig,
            marker,
        })
    }
}
