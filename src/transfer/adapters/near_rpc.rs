//! NEAR JSON-RPC chain client
//!
//! Queries access-key nonces, and signs and submits batch transactions. A batch
//! is one transaction carrying one `FunctionCall` action per transfer, signed
//! with the slot's ed25519 key at the slot's submission nonce.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use borsh::BorshSerialize;
use ed25519_dalek::{Signer, SigningKey};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::traits::{ChainRpc, SequenceProvider};
use crate::transfer::error::ChainError;
use crate::transfer::slots::SigningSlot;
use crate::transfer::types::{SubmitOutcome, TransferAction};

const ED25519_PREFIX: &str = "ed25519:";
const KEY_TYPE_ED25519: u8 = 0;

// ============================================================
// WIRE TYPES (borsh layout of a NEAR transaction)
// ============================================================

#[derive(Debug, Clone, BorshSerialize)]
struct PublicKey {
    key_type: u8,
    data: [u8; 32],
}

#[derive(Debug, Clone, BorshSerialize)]
struct Signature {
    key_type: u8,
    data: [u8; 64],
}

#[derive(Debug, Clone, BorshSerialize)]
struct FunctionCallAction {
    method_name: String,
    args: Vec<u8>,
    gas: u64,
    deposit: u128,
}

/// Leading variants keep the borsh discriminant of `FunctionCall` at 2
#[allow(dead_code)]
#[derive(Debug, Clone, BorshSerialize)]
enum Action {
    CreateAccount,
    DeployContract { code: Vec<u8> },
    FunctionCall(Box<FunctionCallAction>),
}

#[derive(Debug, Clone, BorshSerialize)]
struct Transaction {
    signer_id: String,
    public_key: PublicKey,
    nonce: u64,
    receiver_id: String,
    block_hash: [u8; 32],
    actions: Vec<Action>,
}

#[derive(Debug, Clone, BorshSerialize)]
struct SignedTransaction {
    transaction: Transaction,
    signature: Signature,
}

/// JSON-RPC request envelope
#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

// ============================================================
// KEYS
// ============================================================

fn decode_key(s: &str) -> Result<Vec<u8>, ChainError> {
    let body = s.strip_prefix(ED25519_PREFIX).unwrap_or(s);
    bs58::decode(body)
        .into_vec()
        .map_err(|e| ChainError::InvalidKey(format!("bad base58: {}", e)))
}

/// Parse an `ed25519:<base58>` secret key (64-byte expanded form or 32-byte seed)
pub fn parse_secret_key(s: &str) -> Result<SigningKey, ChainError> {
    let bytes = decode_key(s)?;
    let seed: [u8; 32] = match bytes.len() {
        32 | 64 => bytes[..32]
            .try_into()
            .map_err(|_| ChainError::InvalidKey("bad seed".to_string()))?,
        n => return Err(ChainError::InvalidKey(format!("expected 32 or 64 bytes, got {}", n))),
    };
    let key = SigningKey::from_bytes(&seed);
    if bytes.len() == 64 && bytes[32..] != key.verifying_key().to_bytes() {
        return Err(ChainError::InvalidKey("public half does not match seed".to_string()));
    }
    Ok(key)
}

/// Parse an `ed25519:<base58>` public key
pub fn parse_public_key(s: &str) -> Result<[u8; 32], ChainError> {
    let bytes = decode_key(s)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| ChainError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))
}

/// `ed25519:<base58>` form of a key's public half
pub fn public_key_string(key: &SigningKey) -> String {
    format!(
        "{}{}",
        ED25519_PREFIX,
        bs58::encode(key.verifying_key().to_bytes()).into_string()
    )
}

// ============================================================
// SIGNING
// ============================================================

/// Borsh-encoded signed transaction plus its base58 hash
struct SignedBatch {
    bytes: Vec<u8>,
    hash: String,
}

fn build_actions(actions: &[TransferAction]) -> Result<Vec<Action>, ChainError> {
    actions
        .iter()
        .map(|a| {
            let args = serde_json::to_vec(&a.args())
                .map_err(|e| ChainError::Serialization(e.to_string()))?;
            Ok(Action::FunctionCall(Box::new(FunctionCallAction {
                method_name: a.method_name().to_string(),
                args,
                gas: a.gas,
                deposit: a.deposit,
            })))
        })
        .collect()
}

fn sign_transaction(key: &SigningKey, transaction: Transaction) -> Result<SignedBatch, ChainError> {
    let encoded = borsh::to_vec(&transaction).map_err(|e| ChainError::Serialization(e.to_string()))?;
    let digest: [u8; 32] = Sha256::digest(&encoded).into();
    let signature = key.sign(&digest);

    let signed = SignedTransaction {
        transaction,
        signature: Signature {
            key_type: KEY_TYPE_ED25519,
            data: signature.to_bytes(),
        },
    };
    Ok(SignedBatch {
        bytes: borsh::to_vec(&signed).map_err(|e| ChainError::Serialization(e.to_string()))?,
        hash: bs58::encode(digest).into_string(),
    })
}

// ============================================================
// RESPONSE PARSING
// ============================================================

fn rpc_error(error: &Value) -> ChainError {
    let name = error["name"].as_str().unwrap_or("UNKNOWN");
    let cause = error.pointer("/cause/name").and_then(Value::as_str).unwrap_or("");
    let detail = if error["data"].is_null() {
        error["message"].to_string()
    } else {
        error["data"].to_string()
    };
    if cause == "INVALID_TRANSACTION" {
        ChainError::Rejected(format!("{}: {}", cause, detail))
    } else {
        ChainError::Rpc(format!("{} {}: {}", name, cause, detail))
    }
}

fn parse_access_key_nonce(result: &Value) -> Result<u64, ChainError> {
    if let Some(error) = result.get("error") {
        return Err(ChainError::Rpc(error.to_string()));
    }
    result["nonce"]
        .as_u64()
        .ok_or_else(|| ChainError::Rpc(format!("access key response without nonce: {}", result)))
}

fn parse_block_hash(result: &Value) -> Result<[u8; 32], ChainError> {
    let encoded = result
        .pointer("/header/hash")
        .and_then(Value::as_str)
        .ok_or_else(|| ChainError::Rpc("block response without header.hash".to_string()))?;
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| ChainError::Rpc(format!("bad block hash: {}", e)))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| ChainError::Rpc(format!("block hash has {} bytes", bytes.len())))
}

/// Any `Failure` in the transaction or its receipts fails the whole batch
fn parse_outcome(result: &Value, computed_hash: &str) -> Result<SubmitOutcome, ChainError> {
    if let Some(failure) = result.pointer("/status/Failure") {
        return Err(ChainError::Rejected(failure.to_string()));
    }
    if let Some(receipts) = result["receipts_outcome"].as_array() {
        for receipt in receipts {
            if let Some(failure) = receipt.pointer("/outcome/status/Failure") {
                return Err(ChainError::Rejected(failure.to_string()));
            }
        }
    }
    let transaction_hash = result
        .pointer("/transaction/hash")
        .and_then(Value::as_str)
        .unwrap_or(computed_hash)
        .to_string();
    Ok(SubmitOutcome { transaction_hash })
}

// ============================================================
// CLIENT
// ============================================================

pub struct NearRpcClient {
    client: Client,
    rpc_url: String,
    request_id: AtomicU64,
}

impl NearRpcClient {
    pub fn new(rpc_url: &str, request_timeout: Duration) -> Result<Self, ChainError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            rpc_url: rpc_url.to_string(),
            request_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self.client.post(&self.rpc_url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChainError::Rpc(format!("{} failed: HTTP {} - {}", method, status, body)));
        }

        let body: JsonRpcResponse = response.json().await?;
        if let Some(error) = body.error {
            return Err(rpc_error(&error));
        }
        body.result
            .ok_or_else(|| ChainError::Rpc(format!("{} returned no result", method)))
    }

    async fn latest_block_hash(&self) -> Result<[u8; 32], ChainError> {
        let result = self.call("block", json!({ "finality": "final" })).await?;
        parse_block_hash(&result)
    }
}

#[async_trait]
impl SequenceProvider for NearRpcClient {
    async fn query_starting_sequence(
        &self,
        account_id: &str,
        public_key: &str,
    ) -> Result<u64, ChainError> {
        let result = self
            .call(
                "query",
                json!({
                    "request_type": "view_access_key",
                    "finality": "final",
                    "account_id": account_id,
                    "public_key": public_key,
                }),
            )
            .await?;
        parse_access_key_nonce(&result)
    }
}

#[async_trait]
impl ChainRpc for NearRpcClient {
    async fn submit(
        &self,
        account_id: &str,
        contract_id: &str,
        actions: &[TransferAction],
        slot: &SigningSlot,
    ) -> Result<SubmitOutcome, ChainError> {
        let key = parse_secret_key(slot.secret_key())?;
        let public_key = PublicKey {
            key_type: KEY_TYPE_ED25519,
            data: parse_public_key(slot.public_key())?,
        };
        let block_hash = self.latest_block_hash().await?;

        let transaction = Transaction {
            signer_id: account_id.to_string(),
            public_key,
            nonce: slot.submit_nonce(),
            receiver_id: contract_id.to_string(),
            block_hash,
            actions: build_actions(actions)?,
        };
        let signed = sign_transaction(&key, transaction)?;

        log::debug!(
            "Broadcasting {} with {} actions at nonce {}",
            signed.hash,
            actions.len(),
            slot.submit_nonce()
        );
        let result = self
            .call("broadcast_tx_commit", json!([BASE64.encode(&signed.bytes)]))
            .await?;
        parse_outcome(&result, &signed.hash)
    }

    fn name(&self) -> &str {
        "near-rpc"
    }
}
