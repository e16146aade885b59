//! サービスアイデンティティとブローカー設定。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::key::FingerprintAlgorithm;

/// assertion_lifetime_secs のデフォルト値（3600 秒 = 1 時間）。
fn default_assertion_lifetime_secs() -> u64 {
    3600
}

/// clock_skew_secs のデフォルト値（30 秒）。
fn default_clock_skew_secs() -> u64 {
    30
}

/// token_skew_secs のデフォルト値（30 秒）。
fn default_token_skew_secs() -> u64 {
    30
}

/// timeout_secs のデフォルト値（10 秒）。
fn default_timeout_secs() -> u64 {
    10
}

/// ServiceIdentity は 1 つのバックエンドサービスに対する認証情報を表す。
///
/// 起動時に設定ファイルから読み込まれ、以後は不変。
/// 他のコンポーネントは `name` を介して参照する（コピーしない）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// サービス名（レジストリのキー）。
    pub name: String,

    /// トークンエンドポイントに提示するクライアント ID（`sub` / `iss` にも使用）。
    pub client_id: String,

    /// アクセス対象リソースの ID。
    pub resource_id: String,

    /// 鍵ストアルートからの相対パスで指定する秘密鍵 PEM ファイル。
    pub private_key_file: String,

    /// 鍵ストアルートからの相対パスで指定する X.509 証明書 PEM ファイル。
    pub certificate_file: String,

    /// ダウンストリーム REST API のベース URL。
    pub base_url: String,

    /// アサーションを交換するトークンエンドポイント URL。
    pub token_endpoint: String,

    /// アサーションの `aud` クレームの上書き値。
    ///
    /// 省略時はトークンエンドポイント URL を使う。検証側が URL 以外の
    /// 固定値（例: `/token`）を期待する場合のみ設定する。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
}

/// BrokerConfig はアサーション認証ブローカー全体の設定を表す。
///
/// YAML または JSON から serde でデシリアライズ可能。設定ファイルの
/// 読み込み自体は呼び出し側の責務で、本クレートは構造体のみを定義する。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// 鍵・証明書ファイルを解決する信頼済みルートディレクトリ。
    pub key_store_dir: PathBuf,

    /// サービス名からアイデンティティへのマップ。
    #[serde(default)]
    pub services: HashMap<String, ServiceIdentity>,

    /// アサーションの有効期間（秒、デフォルト: 3600）。
    #[serde(default = "default_assertion_lifetime_secs")]
    pub assertion_lifetime_secs: u64,

    /// `iat` をさかのぼらせるクロックスキュー許容量（秒、デフォルト: 30）。
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,

    /// 有効期限の何秒前からキャッシュ済みトークンを無効とみなすか（デフォルト: 30）。
    #[serde(default = "default_token_skew_secs")]
    pub token_skew_secs: u64,

    /// HTTP タイムアウト秒数（デフォルト: 10）。
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// kid 導出に使うフィンガープリントアルゴリズム（デフォルト: sha1）。
    #[serde(default)]
    pub fingerprint_algorithm: FingerprintAlgorithm,
}

impl BrokerConfig {
    /// 鍵ストアルートのみを指定して BrokerConfig を生成する。
    pub fn new(key_store_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_store_dir: key_store_dir.into(),
            services: HashMap::new(),
            assertion_lifetime_secs: default_assertion_lifetime_secs(),
            clock_skew_secs: default_clock_skew_secs(),
            token_skew_secs: default_token_skew_secs(),
            timeout_secs: default_timeout_secs(),
            fingerprint_algorithm: FingerprintAlgorithm::default(),
        }
    }

    /// サービスアイデンティティを登録する。
    pub fn with_identity(mut self, identity: ServiceIdentity) -> Self {
        self.services.insert(identity.name.clone(), identity);
        self
    }

    /// アサーション有効期間を設定する。
    pub fn with_assertion_lifetime_secs(mut self, secs: u64) -> Self {
        self.assertion_lifetime_secs = secs;
        self
    }

    /// クロックスキュー許容量を設定する。
    pub fn with_clock_skew_secs(mut self, secs: u64) -> Self {
        self.clock_skew_secs = secs;
        self
    }

    /// トークンキャッシュの安全マージンを設定する。
    pub fn with_token_skew_secs(mut self, secs: u64) -> Self {
        self.token_skew_secs = secs;
        self
    }

    /// HTTP タイムアウトを設定する。
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// フィンガープリントアルゴリズムを設定する。
    pub fn with_fingerprint_algorithm(mut self, algorithm: FingerprintAlgorithm) -> Self {
        self.fingerprint_algorithm = algorithm;
        self
    }

    /// 名前でサービスアイデンティティを検索する。
    pub fn identity(&self, name: &str) -> Option<&ServiceIdentity> {
        self.services.get(name)
    }
}
