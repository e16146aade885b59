//! サービスアイデンティティごとのアクセストークンキャッシュ。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::token::AccessToken;

/// TokenCache はアイデンティティ名をキーにアクセストークンを保持する。
///
/// 唯一の共有可変状態であり、全ての読み書きは内部ロックを経由する。
/// 破棄は読み出し時の期限切れ判定と明示的な `invalidate`（ダウンストリーム
/// の 401 時）のみで、能動的な掃き出しは行わない。
pub struct TokenCache {
    entries: RwLock<HashMap<String, AccessToken>>,
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    skew_secs: u64,
}

impl TokenCache {
    /// 安全マージン（秒）を指定してキャッシュを生成する。
    pub fn new(skew_secs: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
            skew_secs,
        }
    }

    /// まだ送信可能なトークンを返す。期限切れエントリは読み出し時に破棄する。
    pub fn get_valid(&self, name: &str) -> Option<AccessToken> {
        {
            let entries = self.entries.read().unwrap();
            match entries.get(name) {
                Some(token) if token.is_valid(self.skew_secs) => return Some(token.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // 期限切れなので Write ロックを取り直して破棄する
        let mut entries = self.entries.write().unwrap();
        if let Some(token) = entries.get(name) {
            if token.is_valid(self.skew_secs) {
                return Some(token.clone());
            }
            debug!(service = %name, "期限切れトークンをキャッシュから破棄します");
            entries.remove(name);
        }
        None
    }

    /// トークンを格納する（後勝ち）。
    pub fn put(&self, name: &str, token: AccessToken) {
        self.entries
            .write()
            .unwrap()
            .insert(name.to_string(), token);
    }

    /// 指定アイデンティティのトークンを明示的に破棄する。
    pub fn invalidate(&self, name: &str) {
        self.entries.write().unwrap().remove(name);
    }

    /// アイデンティティごとの交換直列化ロックを返す。
    ///
    /// 同一アイデンティティに対する同時リフレッシュを最大 1 件の
    /// インフライト交換に抑えるため、呼び出し側はこのロックを取得してから
    /// キャッシュを再確認し、ミスのときだけ交換を実行する。
    pub fn refresh_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.refresh_locks.lock().unwrap();
        Arc::clone(
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn make_token_with_acquired_at(expires_in: u64, age_secs: i64) -> AccessToken {
        AccessToken {
            access_token: "tok".to_string(),
            token_type: "Bearer".to_string(),
            expires_in,
            acquired_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[test]
    fn test_get_valid_empty_cache() {
        let cache = TokenCache::new(30);
        assert!(cache.get_valid("InvAdmin").is_none());
    }

    #[test]
    fn test_put_then_get_valid() {
        let cache = TokenCache::new(30);
        cache.put("InvAdmin", make_token_with_acquired_at(3600, 0));

        let token = cache.get_valid("InvAdmin").unwrap();
        assert_eq!(token.access_token, "tok");
    }

    #[test]
    fn test_get_valid_inside_skew_boundary() {
        // 経過 3569 秒: expires_at - skew まで 1 秒残っているので有効
        let cache = TokenCache::new(30);
        cache.put("InvAdmin", make_token_with_acquired_at(3600, 3569));
        assert!(cache.get_valid("InvAdmin").is_some());
    }

    #[test]
    fn test_get_valid_outside_skew_boundary() {
        // 経過 3571 秒: expires_at - skew を 1 秒過ぎているので無効
        let cache = TokenCache::new(30);
        cache.put("InvAdmin", make_token_with_acquired_at(3600, 3571));
        assert!(cache.get_valid("InvAdmin").is_none());
    }

    #[test]
    fn test_expired_entry_removed_on_read() {
        let cache = TokenCache::new(30);
        cache.put("InvAdmin", make_token_with_acquired_at(3600, 4000));

        assert!(cache.get_valid("InvAdmin").is_none());
        // 破棄済みなので 2 回目も None（エントリ自体が消えている）
        assert!(cache.entries.read().unwrap().get("InvAdmin").is_none());
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let cache = TokenCache::new(30);
        cache.put("InvAdmin", make_token_with_acquired_at(3600, 0));
        cache.invalidate("InvAdmin");
        assert!(cache.get_valid("InvAdmin").is_none());
    }

    #[test]
    fn test_entries_are_per_identity() {
        let cache = TokenCache::new(30);
        cache.put("InvAdmin", make_token_with_acquired_at(3600, 0));
        cache.put("MqMonth", make_token_with_acquired_at(3600, 4000));

        assert!(cache.get_valid("InvAdmin").is_some());
        assert!(cache.get_valid("MqMonth").is_none());
    }

    #[test]
    fn test_put_last_writer_wins() {
        let cache = TokenCache::new(30);
        cache.put("InvAdmin", make_token_with_acquired_at(3600, 0));

        let mut newer = make_token_with_acquired_at(3600, 0);
        newer.access_token = "newer".to_string();
        cache.put("InvAdmin", newer);

        assert_eq!(cache.get_valid("InvAdmin").unwrap().access_token, "newer");
    }

    #[test]
    fn test_refresh_lock_same_identity_shared() {
        let cache = TokenCache::new(30);
        let first = cache.refresh_lock("InvAdmin");
        let second = cache.refresh_lock("InvAdmin");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_refresh_lock_distinct_per_identity() {
        let cache = TokenCache::new(30);
        let a = cache.refresh_lock("InvAdmin");
        let b = cache.refresh_lock("MqMonth");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_refresh_lock_serializes_refresh() {
        let cache = Arc::new(TokenCache::new(30));
        let lock = cache.refresh_lock("InvAdmin");

        let guard = lock.lock().await;
        let second = cache.refresh_lock("InvAdmin");
        assert!(second.try_lock().is_err());
        drop(guard);
    }
}
