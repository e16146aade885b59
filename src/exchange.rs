//! 署名済みアサーションとアクセストークンの交換。

use serde::Deserialize;
use tracing::{debug, error};

use crate::config::ServiceIdentity;
use crate::error::BrokerError;
use crate::token::AccessToken;

/// token_type 省略時のデフォルト。
fn default_token_type() -> String {
    "Bearer".to_string()
}

/// expires_in 省略時のデフォルト（3600 秒）。
fn default_expires_in() -> u64 {
    3600
}

/// トークンエンドポイントのレスポンス。
///
/// `access_token` は必須。`token_type` と `expires_in` は実装依存の
/// 省略可能フィールドとして扱う。
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

/// 署名済みアサーションをトークンエンドポイントへ POST し、
/// アクセストークンを取得する。
///
/// ボディは `application/x-www-form-urlencoded` で
/// `grant_type` / `clnt_id` / `resource` / `client_assertion` を送る。
/// レスポンスボディはステータスにかかわらず全て読み切ってから処理する。
pub async fn exchange(
    http: &reqwest::Client,
    identity: &ServiceIdentity,
    assertion: &str,
) -> Result<AccessToken, BrokerError> {
    debug!(
        service = %identity.name,
        token_endpoint = %identity.token_endpoint,
        "アサーションをアクセストークンへ交換します"
    );

    let params = [
        ("grant_type", "client"),
        ("clnt_id", identity.client_id.as_str()),
        ("resource", identity.resource_id.as_str()),
        ("client_assertion", assertion.trim()),
    ];

    let response = http
        .post(&identity.token_endpoint)
        .form(&params)
        .send()
        .await
        .map_err(|e| {
            error!(service = %identity.name, error = %e, "トークンエンドポイントへのリクエストに失敗しました");
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
        })?;

    let status = response.status();
    let body = response.text().await.map_err(|e| BrokerError::Network {
        service: identity.name.clone(),
        detail: e.to_string(),
    })?;

    if !status.is_success() {
        error!(
            service = %identity.name,
            status = %status,
            body = %body,
            "トークン取得に失敗しました"
        );
        return Err(BrokerError::TokenEndpoint {
            service: identity.name.clone(),
            status: status.as_u16(),
            body,
        });
    }

    let token_resp: TokenResponse =
        serde_json::from_str(&body).map_err(|e| BrokerError::ResponseDecode {
            service: identity.name.clone(),
            detail: e.to_string(),
        })?;

    debug!(
        service = %identity.name,
        expires_in = token_resp.expires_in,
        "アクセストークンを取得しました"
    );

    Ok(AccessToken::new(
        token_resp.access_token,
        token_resp.token_type,
        token_resp.expires_in,
    ))
}
