//! k1s0-assertion-auth: JWT クライアントアサーション認証ブローカー。
//!
//! 設定済みバックエンドサービスごとに RSA 秘密鍵と X.509 証明書を読み込み、
//! 証明書フィンガープリントから kid を導出し、短命の RS256 アサーションを
//! 署名してトークンエンドポイントで Bearer アクセストークンへ交換する。
//! トークンはアイデンティティ単位でキャッシュされ、期限内は交換を省略する。
//!
//! # 使い方
//!
//! ```ignore
//! use k1s0_assertion_auth::{AssertionBroker, BrokerConfig, HttpAssertionBroker, ServiceIdentity};
//!
//! let config = BrokerConfig::new("pki").with_identity(ServiceIdentity {
//!     name: "InvAdmin".into(),
//!     client_id: "client-001".into(),
//!     resource_id: "urn:k1s0:inventory".into(),
//!     private_key_file: "inventory-admin.key.pem".into(),
//!     certificate_file: "inventory-admin.crt.pem".into(),
//!     base_url: "https://inventory.example.com".into(),
//!     token_endpoint: "https://auth.example.com/token".into(),
//!     audience: None,
//! });
//!
//! let broker = HttpAssertionBroker::new(config).unwrap();
//!
//! // キャッシュ済みトークン付きで認証リクエストを発行
//! let items = broker.get("InvAdmin", "/items").await.unwrap();
//! ```

pub mod assertion;
pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod exchange;
pub mod key;
pub mod token;

pub use assertion::{build_assertion, AssertionClaims};
pub use broker::{AssertionBroker, HttpAssertionBroker};
pub use cache::TokenCache;
pub use config::{BrokerConfig, ServiceIdentity};
pub use error::BrokerError;
pub use exchange::exchange;
pub use key::{fingerprint, FingerprintAlgorithm, KeyMaterial, KeyStore};
pub use token::AccessToken;

#[cfg(feature = "mock")]
pub use broker::MockAssertionBroker;
