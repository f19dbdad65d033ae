//! EIP-712 order signing and L1/L2 request authentication.
//!
//! Implements gasless CLOB order signing: orders are signed typed data,
//! authenticated requests carry either an L1 wallet signature (for API
//! key derivation) or HMAC L2 headers derived from the API secret.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip712::{EIP712Domain, Eip712DomainType, TypedData, Types};
use ethers::types::{Address, U256};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::config::SignatureMode;
use crate::types::OrderSide;

const CTF_EXCHANGE_DOMAIN: &str = "Polymarket CTF Exchange";
const CLOB_AUTH_DOMAIN: &str = "ClobAuthDomain";
const DOMAIN_VERSION: &str = "1";
const CLOB_AUTH_MESSAGE: &str = "This message attests that I control the given wallet";
const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Collateral and share amounts are 6-decimal fixed point on chain.
const AMOUNT_SCALE: f64 = 1_000_000.0;

fn exchange_address_for_chain(chain_id: u64) -> Result<Address> {
    match chain_id {
        // Polygon mainnet CTF exchange.
        137 => Ok("0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E"
            .parse()
            .context("invalid mainnet exchange address constant")?),
        // Amoy testnet.
        80002 => Ok("0xdFE02Eb6733538f8Ea35D585af8DE5958AD99E40"
            .parse()
            .context("invalid Amoy exchange address constant")?),
        _ => bail!("unsupported chain_id {chain_id} for order signing"),
    }
}

/// Credentials for L2-authenticated CLOB endpoints.
#[derive(Debug, Clone)]
pub struct ApiCreds {
    pub key: String,
    pub secret: String,
    pub passphrase: String,
}

/// Per-wallet order signer. Holds the hot key for one bot.
pub struct OrderSigner {
    wallet: LocalWallet,
    chain_id: u64,
    mode: SignatureMode,
    funder: Option<Address>,
}

impl OrderSigner {
    pub fn new(
        secret_hex: &str,
        chain_id: u64,
        mode: SignatureMode,
        funder_address: Option<&str>,
    ) -> Result<Self> {
        let wallet: LocalWallet = secret_hex
            .trim()
            .trim_start_matches("0x")
            .parse()
            .context("invalid wallet secret for order signing")?;
        let funder = match funder_address {
            Some(addr) => Some(addr.parse().context("invalid funder address")?),
            None => None,
        };
        if mode == SignatureMode::Proxy && funder.is_none() {
            bail!("proxy signature mode requires a funder address");
        }
        Ok(Self {
            wallet,
            chain_id,
            mode,
            funder,
        })
    }

    /// Signing key's address.
    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Address that holds the collateral (the proxy funder, or the
    /// signing key itself in direct mode).
    pub fn maker_address(&self) -> Address {
        match self.mode {
            SignatureMode::Proxy => self.funder.unwrap_or_else(|| self.wallet.address()),
            SignatureMode::Direct => self.wallet.address(),
        }
    }

    fn signature_type(&self) -> u8 {
        match self.mode {
            SignatureMode::Direct => 0,
            SignatureMode::Proxy => 2,
        }
    }

    /// Build and sign a FOK market order, returning the JSON body for
    /// POST /order. `limit_price` is the marketable price used to size
    /// the share leg from the USD notional.
    pub async fn sign_market_order(
        &self,
        token_id: &str,
        side: OrderSide,
        amount_usd: f64,
        limit_price: f64,
    ) -> Result<Value> {
        if limit_price <= 0.0 || !limit_price.is_finite() {
            bail!("limit price must be positive");
        }
        let shares = amount_usd / limit_price;
        let usdc_scaled = U256::from((amount_usd.max(0.0) * AMOUNT_SCALE).round() as u128);
        let shares_scaled = U256::from((shares.max(0.0) * AMOUNT_SCALE).round() as u128);
        // BUY: give USDC, take shares. SELL: give shares, take USDC.
        let (maker_amount, taker_amount) = match side {
            OrderSide::Buy => (usdc_scaled, shares_scaled),
            OrderSide::Sell => (shares_scaled, usdc_scaled),
        };

        let salt = U256::from(rand::random::<u64>());
        let nonce = U256::zero();
        let maker = self.maker_address();
        let signer = self.address();

        let typed = self.order_typed_data(
            token_id,
            side,
            maker,
            signer,
            maker_amount,
            taker_amount,
            salt,
            nonce,
        )?;
        let signature = self
            .wallet
            .sign_typed_data(&typed)
            .await
            .context("failed to sign order typed data")?;
        let sig = signature.to_string();
        let sig = if sig.starts_with("0x") { sig } else { format!("0x{sig}") };

        Ok(json!({
            "salt": salt.to_string(),
            "maker": format!("{maker:#x}"),
            "signer": format!("{signer:#x}"),
            "taker": ZERO_ADDRESS,
            "tokenId": token_id,
            "makerAmount": maker_amount.to_string(),
            "takerAmount": taker_amount.to_string(),
            "expiration": "0",
            "nonce": nonce.to_string(),
            "feeRateBps": "0",
            "side": side.to_string(),
            "signatureType": self.signature_type(),
            "signature": sig,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn order_typed_data(
        &self,
        token_id: &str,
        side: OrderSide,
        maker: Address,
        signer: Address,
        maker_amount: U256,
        taker_amount: U256,
        salt: U256,
        nonce: U256,
    ) -> Result<TypedData> {
        let token = U256::from_dec_str(token_id)
            .with_context(|| format!("invalid token_id '{token_id}' for order signing"))?;

        let domain = EIP712Domain {
            name: Some(CTF_EXCHANGE_DOMAIN.to_string()),
            version: Some(DOMAIN_VERSION.to_string()),
            chain_id: Some(self.chain_id.into()),
            verifying_contract: Some(exchange_address_for_chain(self.chain_id)?),
            salt: None,
        };

        let mut types: Types = BTreeMap::new();
        types.insert(
            "Order".to_string(),
            [
                ("salt", "uint256"),
                ("maker", "address"),
                ("signer", "address"),
                ("taker", "address"),
                ("tokenId", "uint256"),
                ("makerAmount", "uint256"),
                ("takerAmount", "uint256"),
                ("expiration", "uint256"),
                ("nonce", "uint256"),
                ("feeRateBps", "uint256"),
                ("side", "uint8"),
                ("signatureType", "uint8"),
            ]
            .iter()
            .map(|(name, ty)| Eip712DomainType {
                name: name.to_string(),
                r#type: ty.to_string(),
            })
            .collect(),
        );

        let mut message = BTreeMap::<String, Value>::new();
        message.insert("salt".into(), Value::String(salt.to_string()));
        message.insert("maker".into(), Value::String(format!("{maker:#x}")));
        message.insert("signer".into(), Value::String(format!("{signer:#x}")));
        message.insert("taker".into(), Value::String(ZERO_ADDRESS.to_string()));
        message.insert("tokenId".into(), Value::String(token.to_string()));
        message.insert("makerAmount".into(), Value::String(maker_amount.to_string()));
        message.insert("takerAmount".into(), Value::String(taker_amount.to_string()));
        message.insert("expiration".into(), Value::String("0".to_string()));
        message.insert("nonce".into(), Value::String(nonce.to_string()));
        message.insert("feeRateBps".into(), Value::String("0".to_string()));
        message.insert(
            "side".into(),
            Value::from(match side {
                OrderSide::Buy => 0_u8,
                OrderSide::Sell => 1_u8,
            }),
        );
        message.insert("signatureType".into(), Value::from(self.signature_type()));

        Ok(TypedData {
            domain,
            types,
            primary_type: "Order".to_string(),
            message,
        })
    }

    /// Sign the CLOB auth attestation used to create or derive API keys.
    pub async fn sign_auth_message(&self, timestamp: i64, nonce: u64) -> Result<String> {
        let domain = EIP712Domain {
            name: Some(CLOB_AUTH_DOMAIN.to_string()),
            version: Some(DOMAIN_VERSION.to_string()),
            chain_id: Some(self.chain_id.into()),
            verifying_contract: None,
            salt: None,
        };

        let mut types: Types = BTreeMap::new();
        types.insert(
            "ClobAuth".to_string(),
            [
                ("address", "address"),
                ("timestamp", "string"),
                ("nonce", "uint256"),
                ("message", "string"),
            ]
            .iter()
            .map(|(name, ty)| Eip712DomainType {
                name: name.to_string(),
                r#type: ty.to_string(),
            })
            .collect(),
        );

        let mut message = BTreeMap::<String, Value>::new();
        message.insert(
            "address".into(),
            Value::String(format!("{:#x}", self.address())),
        );
        message.insert("timestamp".into(), Value::String(timestamp.to_string()));
        message.insert("nonce".into(), Value::String(nonce.to_string()));
        message.insert("message".into(), Value::String(CLOB_AUTH_MESSAGE.to_string()));

        let typed = TypedData {
            domain,
            types,
            primary_type: "ClobAuth".to_string(),
            message,
        };

        let signature = self
            .wallet
            .sign_typed_data(&typed)
            .await
            .context("failed to sign auth typed data")?;
        let sig = signature.to_string();
        Ok(if sig.starts_with("0x") { sig } else { format!("0x{sig}") })
    }
}

/// Headers for L1-authenticated endpoints (API key create/derive).
pub fn l1_headers(address: Address, signature: &str, timestamp: i64, nonce: u64) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        "POLY_ADDRESS",
        HeaderValue::from_str(&format!("{address:#x}")).context("bad POLY_ADDRESS header")?,
    );
    headers.insert(
        "POLY_SIGNATURE",
        HeaderValue::from_str(signature).context("bad POLY_SIGNATURE header")?,
    );
    headers.insert(
        "POLY_TIMESTAMP",
        HeaderValue::from_str(&timestamp.to_string()).context("bad POLY_TIMESTAMP header")?,
    );
    headers.insert(
        "POLY_NONCE",
        HeaderValue::from_str(&nonce.to_string()).context("bad POLY_NONCE header")?,
    );
    Ok(headers)
}

/// HMAC-SHA256 signature over `timestamp + method + path + body`,
/// keyed by the base64url-decoded API secret.
pub fn l2_signature(secret: &str, timestamp: i64, method: &str, path: &str, body: &str) -> Result<String> {
    let key = general_purpose::URL_SAFE
        .decode(secret)
        .context("API secret is not valid base64url")?;
    let mut mac =
        Hmac::<Sha256>::new_from_slice(&key).context("API secret has invalid HMAC length")?;
    mac.update(format!("{timestamp}{method}{path}{body}").as_bytes());
    Ok(general_purpose::URL_SAFE.encode(mac.finalize().into_bytes()))
}

/// Headers for L2-authenticated endpoints (orders, balances).
pub fn l2_headers(
    address: Address,
    creds: &ApiCreds,
    method: &str,
    path: &str,
    body: &str,
) -> Result<HeaderMap> {
    let timestamp = Utc::now().timestamp();
    let signature = l2_signature(&creds.secret, timestamp, method, path, body)?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        "POLY_ADDRESS",
        HeaderValue::from_str(&format!("{address:#x}")).context("bad POLY_ADDRESS header")?,
    );
    headers.insert(
        "POLY_SIGNATURE",
        HeaderValue::from_str(&signature).context("bad POLY_SIGNATURE header")?,
    );
    headers.insert(
        "POLY_TIMESTAMP",
        HeaderValue::from_str(&timestamp.to_string()).context("bad POLY_TIMESTAMP header")?,
    );
    headers.insert(
        "POLY_API_KEY",
        HeaderValue::from_str(&creds.key).context("bad POLY_API_KEY header")?,
    );
    headers.insert(
        "POLY_PASSPHRASE",
        HeaderValue::from_str(&creds.passphrase).context("bad POLY_PASSPHRASE header")?,
    );
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";

    #[test]
    fn test_proxy_mode_requires_funder() {
        let res = OrderSigner::new(TEST_KEY, 137, SignatureMode::Proxy, None);
        assert!(res.is_err());
    }

    #[test]
    fn test_maker_is_funder_in_proxy_mode() {
        let funder = "0x00000000000000000000000000000000000000aa";
        let signer =
            OrderSigner::new(TEST_KEY, 137, SignatureMode::Proxy, Some(funder)).unwrap();
        assert_eq!(format!("{:#x}", signer.maker_address()), funder);
        assert_ne!(signer.maker_address(), signer.address());
    }

    #[tokio::test]
    async fn test_sign_market_order_builds_scaled_amounts() {
        let signer = OrderSigner::new(TEST_KEY, 137, SignatureMode::Direct, None).unwrap();
        let body = signer
            .sign_market_order("123456", OrderSide::Buy, 5.0, 0.50)
            .await
            .unwrap();
        assert_eq!(body["makerAmount"], "5000000");
        assert_eq!(body["takerAmount"], "10000000");
        assert_eq!(body["side"], "BUY");
        assert!(body["signature"].as_str().unwrap().starts_with("0x"));
    }

    #[test]
    fn test_l2_signature_is_deterministic() {
        let secret = general_purpose::URL_SAFE.encode(b"super-secret-hmac-key");
        let a = l2_signature(&secret, 1700000000, "POST", "/order", "{}").unwrap();
        let b = l2_signature(&secret, 1700000000, "POST", "/order", "{}").unwrap();
        let c = l2_signature(&secret, 1700000001, "POST", "/order", "{}").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
