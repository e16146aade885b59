//! トークンエンドポイントから取得したアクセストークン。

use chrono::{DateTime, Duration, Utc};

/// アサーション交換で取得した Bearer アクセストークン。
///
/// 取得時刻と有効期間を保持し、安全マージン付きの有効判定を提供する。
/// 生成後はトークンキャッシュが唯一の所有者となる。
#[derive(Debug, Clone)]
pub struct AccessToken {
    /// Bearer アクセストークン文字列。
    pub access_token: String,

    /// トークン種別（通常は "Bearer"）。
    pub token_type: String,

    /// トークンの有効期間（秒）。
    pub expires_in: u64,

    /// トークンを取得した時刻（UTC）。
    pub acquired_at: DateTime<Utc>,
}

impl AccessToken {
    /// 新しい AccessToken を生成する。取得時刻は現在時刻となる。
    pub fn new(access_token: String, token_type: String, expires_in: u64) -> Self {
        Self {
            access_token,
            token_type,
            expires_in,
            acquired_at: Utc::now(),
        }
    }

    /// トークンの有効期限時刻を返す。
    ///
    /// `expires_in` が表現可能な範囲を超える場合は表現可能な最大時刻へ
    /// 丸める（トークンエンドポイントの応答値でパニックしない）。
    pub fn expires_at(&self) -> DateTime<Utc> {
        let lifetime = i64::try_from(self.expires_in)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        self.acquired_at
            .checked_add_signed(lifetime)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// 安全マージンを考慮してまだ送信可能かどうかを返す。
    ///
    /// `now < expires_at - skew` の間だけ `true`。マージンは送信中に
    /// 期限切れとなるトークンを避けるためのもの。
    pub fn is_valid(&self, skew_secs: u64) -> bool {
        let skew = i64::try_from(skew_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        match self.expires_at().checked_sub_signed(skew) {
            Some(deadline) => Utc::now() < deadline,
            None => false,
        }
    }

    /// Authorization ヘッダー用の Bearer 文字列を返す。
    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}
