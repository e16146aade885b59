//! アサーション認証ブローカーのトレイトと HTTP 実装。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::assertion::build_assertion;
use crate::cache::TokenCache;
use crate::config::{BrokerConfig, ServiceIdentity};
use crate::error::BrokerError;
use crate::exchange::exchange;
use crate::key::KeyStore;
use crate::token::AccessToken;

/// AssertionBroker は設定済みサービスへの認証付き REST 呼び出しを提供するトレイト。
///
/// `HttpAssertionBroker` がデフォルト実装。テスト時は `MockAssertionBroker` が使用可能。
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait AssertionBroker: Send + Sync {
    /// 任意のメソッドで認証付きリクエストを発行し、JSON レスポンスを返す。
    ///
    /// トークンキャッシュを参照し、ミス時はアサーション構築と交換を行う。
    /// ダウンストリームが 401 を返した場合はトークンを再取得して
    /// ちょうど 1 回だけ再試行し、再度 401 なら `AuthenticationRejected` を返す。
    async fn request(
        &self,
        service: &str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, BrokerError>;

    /// 認証付き GET。
    async fn get(&self, service: &str, path: &str) -> Result<Value, BrokerError>;

    /// 認証付き POST（ボディは JSON として送信）。
    async fn post(&self, service: &str, path: &str, body: Value) -> Result<Value, BrokerError>;

    /// 認証付き DELETE。
    async fn delete(&self, service: &str, path: &str) -> Result<Value, BrokerError>;

    /// キャッシュ済みまたは新規交換したトークンの Bearer 文字列を返す。
    async fn bearer_token(&self, service: &str) -> Result<String, BrokerError>;

    /// 鍵ローテーション時に鍵マテリアルとトークンのキャッシュを破棄する。
    fn invalidate_key_material(&self, service: &str);
}

/// HttpAssertionBroker は reqwest を使った AssertionBroker の HTTP 実装。
///
/// アイデンティティレジストリ・鍵ストア・トークンキャッシュを所有し、
/// プロセスワイドなグローバル状態を持たない。
pub struct HttpAssertionBroker {
    config: BrokerConfig,
    http: reqwest::Client,
    keys: KeyStore,
    tokens: TokenCache,
}

impl HttpAssertionBroker {
    /// 設定からブローカーを生成する。
    ///
    /// `config.timeout_secs` を全ネットワーク呼び出しのデッドラインとする
    /// HTTP クライアントを内部で生成する。
    pub fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BrokerError::Network {
                service: "broker".to_string(),
                detail: e.to_string(),
            })?;

        let keys = KeyStore::new(config.key_store_dir.clone(), config.fingerprint_algorithm);
        let tokens = TokenCache::new(config.token_skew_secs);

        Ok(Self {
            config,
            http,
            keys,
            tokens,
        })
    }

    fn identity(&self, service: &str) -> Result<&ServiceIdentity, BrokerError> {
        self.config
            .identity(service)
            .ok_or_else(|| BrokerError::UnknownService(service.to_string()))
    }

    /// アサーション構築とトークン交換を 1 回実行する。
    async fn fresh_token(&self, identity: &ServiceIdentity) -> Result<AccessToken, BrokerError> {
        let material = self.keys.load(identity)?;
        let assertion = build_assertion(
            identity,
            &material,
            self.config.assertion_lifetime_secs,
            self.config.clock_skew_secs,
        )?;
        exchange(&self.http, identity, &assertion).await
    }

    /// キャッシュ済みトークンを返す（ミス時は交換を直列化して実行）。
    async fn token_for(&self, identity: &ServiceIdentity) -> Result<AccessToken, BrokerError> {
        if let Some(token) = self.tokens.get_valid(&identity.name) {
            debug!(service = %identity.name, "キャッシュ済みトークンを使用します");
            return Ok(token);
        }

        let lock = self.tokens.refresh_lock(&identity.name);
        let _guard = lock.lock().await;

        // ダブルチェック: 別タスクがすでに交換を完了しているかもしれない
        if let Some(token) = self.tokens.get_valid(&identity.name) {
            debug!(service = %identity.name, "ダブルチェック: キャッシュ済みトークンを使用します");
            return Ok(token);
        }

        let token = self.fresh_token(identity).await?;
        self.tokens.put(&identity.name, token.clone());
        Ok(token)
    }

    async fn send(
        &self,
        identity: &ServiceIdentity,
        method: Method,
        path: &str,
        body: Option<&Value>,
        bearer: &str,
    ) -> Result<reqwest::Response, BrokerError> {
        let url = format!("{}{}", identity.base_url, path);
        let mut request = self
            .http
            .request(method, &url)
            .header(header::AUTHORIZATION, bearer);
        if let Some(body) = body {
            request = request.json(body);
        }

        request.send().await.map_err(|e| {
            if e.is_timeout() {
                BrokerError::Timeout {
                    service: identity.name.clone(),
                }
            } else {
                BrokerError::Network {
                    service: identity.name.clone(),
                    detail: e.to_string(),
                }
            }
        })
    }
}

#[async_trait]
impl AssertionBroker for HttpAssertionBroker {
    async fn request(
        &self,
        service: &str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, BrokerError> {
        let identity = self.identity(service)?;
        let token = self.token_for(identity).await?;
        let response = self
            .send(
                identity,
                method.clone(),
                path,
                body.as_ref(),
                &token.bearer_header(),
            )
            .await?;

        let response = if response.status() == StatusCode::UNAUTHORIZED {
            warn!(
                service = %identity.name,
                "ダウンストリームが 401 を返したためトークンを再取得して再試行します"
            );
            // ボディを読み切って接続を解放してから再試行する
            let _ = response.text().await;
            self.tokens.invalidate(&identity.name);

            let token = self.token_for(identity).await?;
            let retry = self
                .send(identity, method, path, body.as_ref(), &token.bearer_header())
                .await?;
            if retry.status() == StatusCode::UNAUTHORIZED {
                let _ = retry.text().await;
                return Err(BrokerError::AuthenticationRejected {
                    service: identity.name.clone(),
                });
            }
            retry
        } else {
            response
        };

        let status = response.status();
        let text = response.text().await.map_err(|e| BrokerError::Network {
            service: identity.name.clone(),
            detail: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(BrokerError::RequestFailed {
                service: identity.name.clone(),
                status: status.as_u16(),
                body: text,
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| BrokerError::ResponseDecode {
            service: identity.name.clone(),
            detail: e.to_string(),
        })
    }

    async fn get(&self, service: &str, path: &str) -> Result<Value, BrokerError> {
        self.request(service, Method::GET, path, None).await
    }

    async fn post(&self, service: &str, path: &str, body: Value) -> Result<Value, BrokerError> {
        self.request(service, Method::POST, path, Some(body)).await
    }

    async fn delete(&self, service: &str, path: &str) -> Result<Value, BrokerError> {
        self.request(service, Method::DELETE, path, None).await
    }

    async fn bearer_token(&self, service: &str) -> Result<String, BrokerError> {
        let identity = self.identity(service)?;
        let token = self.token_for(identity).await?;
        Ok(token.bearer_header())
    }

    fn invalidate_key_material(&self, service: &str) {
        self.keys.invalidate(service);
        self.tokens.invalidate(service);
    }
}
