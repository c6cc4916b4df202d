//! Request signing
//!
//! Every private REST call and the private WebSocket subscription is
//! authenticated with an ed25519 signature over a canonical string:
//!
//! `instruction=<name>&<k1>=<v1>&...&timestamp=<ms>&window=<ms>`
//!
//! Parameters are sorted by key in byte order. Signing takes every input
//! explicitly; the signer holds nothing but the immutable key pair, so it can
//! be shared across tasks without coordination.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey, Signature};
use reqwest::Method;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::config::Credentials;
use crate::error::{ConnectorError, Result};

pub const SIGNATURE_LEN: usize = 64;

/// Operation names the exchange expects in the signed string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    OrderExecute,
    OrderCancel,
    OrderQuery,
    OrderQueryAll,
    BalanceQuery,
    AccountQuery,
    Subscribe,
}

impl Instruction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Instruction::OrderExecute => "orderExecute",
            Instruction::OrderCancel => "orderCancel",
            Instruction::OrderQuery => "orderQuery",
            Instruction::OrderQueryAll => "orderQueryAll",
            Instruction::BalanceQuery => "balanceQuery",
            Instruction::AccountQuery => "accountQuery",
            Instruction::Subscribe => "subscribe",
        }
    }

    /// Instruction for a REST call. The method is always supplied by the
    /// caller for this request.
    pub fn for_request(method: &Method, path: &str) -> Self {
        let path = path.split('?').next().unwrap_or(path).trim_end_matches('/');
        match (method, path) {
            (&Method::POST, "/order") => Instruction::OrderExecute,
            (&Method::DELETE, "/order") => Instruction::OrderCancel,
            (&Method::GET, "/order") => Instruction::OrderQuery,
            (&Method::GET, "/orders") => Instruction::OrderQueryAll,
            (_, "/balances") | (_, "/capital") => Instruction::BalanceQuery,
            _ => Instruction::AccountQuery,
        }
    }
}

/// A request parameter before canonical stringification
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Decimal(Decimal),
}

impl ParamValue {
    /// Canonical text used both in the signed string and in the request
    pub fn canonical(&self, key: &str) -> Result<String> {
        match self {
            ParamValue::Str(s) => Ok(s.clone()),
            ParamValue::Int(v) => Ok(v.to_string()),
            ParamValue::UInt(v) => Ok(v.to_string()),
            ParamValue::Bool(v) => Ok(v.to_string()),
            ParamValue::Decimal(v) => Ok(v.to_string()),
            ParamValue::Float(v) if v.is_finite() => Ok(v.to_string()),
            ParamValue::Float(v) => Err(ConnectorError::Encoding {
                key: key.to_string(),
                reason: format!("non-finite number {}", v),
            }),
        }
    }

    /// JSON form for request bodies
    pub fn to_json(&self, key: &str) -> Result<Value> {
        Ok(match self {
            ParamValue::Str(s) => Value::String(s.clone()),
            ParamValue::Int(v) => Value::from(*v),
            ParamValue::UInt(v) => Value::from(*v),
            ParamValue::Bool(v) => Value::Bool(*v),
            ParamValue::Decimal(_) | ParamValue::Float(_) => Value::String(self.canonical(key)?),
        })
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<u64> for ParamValue {
    fn from(v: u64) -> Self {
        ParamValue::UInt(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::UInt(v as u64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<Decimal> for ParamValue {
    fn from(v: Decimal) -> Self {
        ParamValue::Decimal(v)
    }
}

/// Ordered request parameters
pub type Params = Vec<(String, ParamValue)>;

/// Build a JSON object body from the same parameters that were signed
pub fn params_to_json(params: &[(String, ParamValue)]) -> Result<Value> {
    let mut body = serde_json::Map::with_capacity(params.len());
    for (key, value) in params {
        body.insert(key.clone(), value.to_json(key)?);
    }
    Ok(Value::Object(body))
}

/// A signed request, built fresh for every outbound call
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub instruction: Instruction,
    pub sorted_parameters: Vec<(String, String)>,
    pub timestamp_ms: i64,
    pub window_ms: u64,
    pub signature: [u8; SIGNATURE_LEN],
}

impl SignedRequest {
    pub fn signature_base64(&self) -> String {
        BASE64.encode(self.signature)
    }

    /// The exact string that was signed
    pub fn signable_string(&self) -> String {
        signable_string(
            self.instruction.as_str(),
            &self.sorted_parameters,
            self.timestamp_ms,
            self.window_ms,
        )
    }

    /// Authentication headers for a REST call
    pub fn headers(&self, api_key: &str) -> [(&'static str, String); 4] {
        [
            ("X-API-KEY", api_key.to_string()),
            ("X-SIGNATURE", self.signature_base64()),
            ("X-TIMESTAMP", self.timestamp_ms.to_string()),
            ("X-WINDOW", self.window_ms.to_string()),
        ]
    }
}

/// Build the canonical signable string from already-sorted parameters
pub fn signable_string(
    instruction: &str,
    sorted_parameters: &[(String, String)],
    timestamp_ms: i64,
    window_ms: u64,
) -> String {
    let mut out = format!("instruction={}", instruction);
    for (key, value) in sorted_parameters {
        out.push('&');
        out.push_str(key);
        out.push('=');
        out.push_str(value);
    }
    out.push_str(&format!("&timestamp={}&window={}", timestamp_ms, window_ms));
    out
}

/// Sort and stringify parameters
pub fn canonical_parameters(params: &[(String, ParamValue)]) -> Result<Vec<(String, String)>> {
    let mut sorted = params
        .iter()
        .map(|(key, value)| Ok((key.clone(), value.canonical(key)?)))
        .collect::<Result<Vec<_>>>()?;
    sorted.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    Ok(sorted)
}

/// Sign a request. Pure function of its inputs.
pub fn sign(
    instruction: Instruction,
    params: &[(String, ParamValue)],
    key: &SigningKey,
    timestamp_ms: i64,
    window_ms: u64,
) -> Result<SignedRequest> {
    let sorted_parameters = canonical_parameters(params)?;
    let message = signable_string(instruction.as_str(), &sorted_parameters, timestamp_ms, window_ms);
    let signature = key.sign(message.as_bytes()).to_bytes();

    Ok(SignedRequest {
        instruction,
        sorted_parameters,
        timestamp_ms,
        window_ms,
        signature,
    })
}

/// Decode a base64 secret into a signing key (32-byte seed or 64-byte keypair)
pub fn decode_signing_key(secret_b64: &str) -> Result<SigningKey> {
    let bytes = BASE64
        .decode(secret_b64.trim())
        .map_err(|e| ConnectorError::KeyFormat(format!("secret is not base64: {}", e)))?;

    match bytes.len() {
        32 => {
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&bytes);
            Ok(SigningKey::from_bytes(&seed))
        }
        64 => {
            let mut pair = [0u8; 64];
            pair.copy_from_slice(&bytes);
            SigningKey::from_keypair_bytes(&pair)
                .map_err(|e| ConnectorError::KeyFormat(format!("inconsistent keypair: {}", e)))
        }
        n => Err(ConnectorError::KeyFormat(format!(
            "private key must be 32 or 64 bytes, got {}",
            n
        ))),
    }
}

/// Decode a base64 public key
pub fn decode_verifying_key(api_key_b64: &str) -> Result<VerifyingKey> {
    let bytes = BASE64
        .decode(api_key_b64.trim())
        .map_err(|e| ConnectorError::KeyFormat(format!("api key is not base64: {}", e)))?;
    let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        ConnectorError::KeyFormat(format!("public key must be 32 bytes, got {}", bytes.len()))
    })?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| ConnectorError::KeyFormat(format!("invalid public key: {}", e)))
}

/// Account key pair, read-only after construction
#[derive(Debug, Clone)]
pub struct RequestSigner {
    api_key: String,
    signing_key: SigningKey,
}

impl RequestSigner {
    pub fn from_credentials(credentials: &Credentials) -> Result<Self> {
        let verifying_key = decode_verifying_key(&credentials.api_key)?;
        let signing_key = decode_signing_key(&credentials.api_secret)?;

        if signing_key.verifying_key() != verifying_key {
            return Err(ConnectorError::KeyFormat(
                "api key does not belong to the secret".to_string(),
            ));
        }

        Ok(Self {
            api_key: credentials.api_key.trim().to_string(),
            signing_key,
        })
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn sign(
        &self,
        instruction: Instruction,
        params: &[(String, ParamValue)],
        timestamp_ms: i64,
        window_ms: u64,
    ) -> Result<SignedRequest> {
        sign(instruction, params, &self.signing_key, timestamp_ms, window_ms)
    }

    /// Sign with the current wall-clock time
    pub fn sign_now(
        &self,
        instruction: Instruction,
        params: &[(String, ParamValue)],
        window_ms: u64,
    ) -> Result<SignedRequest> {
        self.sign(instruction, params, chrono::Utc::now().timestamp_millis(), window_ms)
    }

    /// Authenticated SUBSCRIBE frame for private streams
    pub fn subscribe_frame(&self, streams: &[String], timestamp_ms: i64, window_ms: u64) -> Result<Value> {
        let signed = self.sign(Instruction::Subscribe, &[], timestamp_ms, window_ms)?;
        Ok(serde_json::json!({
            "method": "SUBSCRIBE",
            "params": streams,
            "signature": [
                self.api_key,
                signed.signature_base64(),
                signed.timestamp_ms.to_string(),
                signed.window_ms.to_string(),
            ],
        }))
    }

    pub fn verify(&self, signed: &SignedRequest) -> bool {
        let signature = Signature::from_bytes(&signed.signature);
        self.signing_key
            .verifying_key()
            .verify(signed.signable_string().as_bytes(), &signature)
            .is_ok()
    }
}
