//! クライアントアサーション（短命の署名付き JWT）の構築。

use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, Header};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ServiceIdentity;
use crate::error::BrokerError;
use crate::key::KeyMaterial;

/// クライアントアサーションのクレームセット。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionClaims {
    /// アサーションごとに一意な識別子（リプレイ防止のため毎回生成）。
    pub jti: String,

    /// アサーションの提示先。デフォルトはトークンエンドポイント URL で、
    /// `ServiceIdentity::audience` で上書きできる。
    pub aud: String,

    /// サブジェクト（クライアント ID と同一）。
    pub sub: String,

    /// 発行者（クライアント ID と同一）。
    pub iss: String,

    /// 発行時刻（Unix タイムスタンプ）。クロックスキュー分さかのぼる。
    pub iat: i64,

    /// 有効期限（Unix タイムスタンプ）。
    pub exp: i64,
}

/// アイデンティティの鍵マテリアルでアサーションを構築・署名する。
///
/// ヘッダーは `{alg: RS256, kid: <証明書フィンガープリント>}`。
/// `jti` は呼び出しごとに新しい UUID を採番する。アサーションは
/// トークン交換 1 回ごとに使い捨てで、永続化も再利用もしない。
pub fn build_assertion(
    identity: &ServiceIdentity,
    key_material: &KeyMaterial,
    lifetime_secs: u64,
    clock_skew_secs: u64,
) -> Result<String, BrokerError> {
    let now = Utc::now().timestamp();
    let claims = AssertionClaims {
        jti: Uuid::new_v4().to_string(),
        aud: identity
            .audience
            .clone()
            .unwrap_or_else(|| identity.token_endpoint.clone()),
        sub: identity.client_id.clone(),
        iss: identity.client_id.clone(),
        iat: now - clock_skew_secs as i64,
        exp: now + lifetime_secs as i64,
    };

    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(key_material.kid.clone());

    encode(&header, &claims, &key_material.encoding_key).map_err(|e| {
        BrokerError::SigningFailed {
            service: identity.name.clone(),
            detail: e.to_string(),
        }
    })
}
