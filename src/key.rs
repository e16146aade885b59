//! 鍵マテリアルの読み込みと証明書フィンガープリント（kid）導出。

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use jsonwebtoken::EncodingKey;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tracing::debug;
use x509_parser::pem::parse_x509_pem;

use crate::config::ServiceIdentity;
use crate::error::BrokerError;

/// kid 導出に使うダイジェストアルゴリズム。
///
/// デフォルトは SHA-1。トークンエンドポイント側の鍵検索が SHA-1
/// フィンガープリントを期待する既存環境との互換性を優先している。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintAlgorithm {
    #[default]
    Sha1,
    Sha256,
}

/// 証明書の DER バイト列からフィンガープリントを計算する。
///
/// 区切り文字なしの小文字 16 進文字列を返す。同一入力に対して
/// 常に同一の識別子を返す純粋関数。
pub fn fingerprint(der: &[u8], algorithm: FingerprintAlgorithm) -> String {
    match algorithm {
        FingerprintAlgorithm::Sha1 => hex::encode(Sha1::digest(der)),
        FingerprintAlgorithm::Sha256 => hex::encode(Sha256::digest(der)),
    }
}

/// 1 つのサービスアイデンティティに紐づく署名用鍵マテリアル。
pub struct KeyMaterial {
    /// RS256 署名に使う RSA 秘密鍵。
    pub encoding_key: EncodingKey,

    /// 証明書の正規 DER エンコーディング。
    pub certificate_der: Vec<u8>,

    /// 証明書フィンガープリントから導出した鍵識別子。
    pub kid: String,
}

// EncodingKey が Debug を実装しないため、秘密鍵を伏せて kid のみ出力する
impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("kid", &self.kid)
            .field("certificate_der_len", &self.certificate_der.len())
            .finish_non_exhaustive()
    }
}

/// KeyStore は信頼済みルートディレクトリ配下の鍵・証明書を読み込み、
/// サービス名ごとにプロセス存続期間キャッシュする。
///
/// ロードは一度成功すると `invalidate`（鍵ローテーション時）まで
/// 再実行されない。ネットワークアクセスは行わない。
pub struct KeyStore {
    root: PathBuf,
    algorithm: FingerprintAlgorithm,
    cache: Mutex<HashMap<String, Arc<KeyMaterial>>>,
}

impl KeyStore {
    /// 鍵ストアルートとフィンガープリントアルゴリズムを指定して生成する。
    pub fn new(root: impl Into<PathBuf>, algorithm: FingerprintAlgorithm) -> Self {
        Self {
            root: root.into(),
            algorithm,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// アイデンティティの鍵マテリアルを読み込む（初回以降はキャッシュ）。
    pub fn load(&self, identity: &ServiceIdentity) -> Result<Arc<KeyMaterial>, BrokerError> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(material) = cache.get(&identity.name) {
            return Ok(Arc::clone(material));
        }

        let material = Arc::new(self.load_uncached(identity)?);
        debug!(
            service = %identity.name,
            kid = %material.kid,
            "鍵マテリアルを読み込みました"
        );
        cache.insert(identity.name.clone(), Arc::clone(&material));
        Ok(material)
    }

    /// キャッシュ済み鍵マテリアルを破棄する（鍵ローテーション用）。
    pub fn invalidate(&self, name: &str) {
        self.cache.lock().unwrap().remove(name);
    }

    fn load_uncached(&self, identity: &ServiceIdentity) -> Result<KeyMaterial, BrokerError> {
        let encoding_key = self.load_private_key(identity)?;
        let certificate_der = self.load_certificate_der(identity)?;
        let kid = fingerprint(&certificate_der, self.algorithm);

        Ok(KeyMaterial {
            encoding_key,
            certificate_der,
            kid,
        })
    }

    /// 設定されたファイル名を鍵ストアルート配下のパスへ解決する。
    ///
    /// 絶対パスと `..` を含むパスはルート外へ抜けられるため拒否する。
    fn resolve(&self, service: &str, file_name: &str) -> Result<PathBuf, BrokerError> {
        let relative = Path::new(file_name);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(BrokerError::KeyNotFound {
                service: service.to_string(),
                path: file_name.to_string(),
            });
        }

        let full = self.root.join(relative);
        if !full.exists() {
            return Err(BrokerError::KeyNotFound {
                service: service.to_string(),
                path: full.display().to_string(),
            });
        }
        Ok(full)
    }

    fn read_file(&self, service: &str, file_name: &str) -> Result<Vec<u8>, BrokerError> {
        let path = self.resolve(service, file_name)?;
        fs::read(&path).map_err(|_| BrokerError::KeyNotFound {
            service: service.to_string(),
            path: path.display().to_string(),
        })
    }

    fn load_private_key(&self, identity: &ServiceIdentity) -> Result<EncodingKey, BrokerError> {
        let bytes = self.read_file(&identity.name, &identity.private_key_file)?;

        let block = pem::parse(&bytes).map_err(|e| BrokerError::KeyFormatInvalid {
            service: identity.name.clone(),
            detail: format!("秘密鍵の PEM 解析に失敗: {e}"),
        })?;

        match block.tag() {
            "RSA PRIVATE KEY" | "PRIVATE KEY" => {}
            other => {
                return Err(BrokerError::KeyTypeUnsupported {
                    service: identity.name.clone(),
                    detail: format!("RSA 秘密鍵ではありません: {other}"),
                })
            }
        }

        EncodingKey::from_rsa_pem(&bytes).map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::InvalidKeyFormat => BrokerError::KeyTypeUnsupported {
                service: identity.name.clone(),
                detail: "RSA として解釈できない秘密鍵です".to_string(),
            },
            _ => BrokerError::KeyFormatInvalid {
                service: identity.name.clone(),
                detail: format!("RSA 秘密鍵の読み込みに失敗: {e}"),
            },
        })
    }

    fn load_certificate_der(&self, identity: &ServiceIdentity) -> Result<Vec<u8>, BrokerError> {
        let bytes = self.read_file(&identity.name, &identity.certificate_file)?;

        let (_, parsed) = parse_x509_pem(&bytes).map_err(|e| BrokerError::KeyFormatInvalid {
            service: identity.name.clone(),
            detail: format!("証明書の PEM 解析に失敗: {e}"),
        })?;

        // フィンガープリントは再シリアライズではなく元の DER バイト列に対して
        // 計算するため、X.509 構造の検証のみ行い contents をそのまま保持する
        parsed
            .parse_x509()
            .map_err(|e| BrokerError::KeyFormatInvalid {
                service: identity.name.clone(),
                detail: format!("X.509 証明書の解析に失敗: {e}"),
            })?;

        Ok(parsed.contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// test_data/pki/inventory-admin.crt.pem の既知フィンガープリント。
    const EXPECTED_SHA1: &str = "656d7491b89a7f767bc8a8bd744657525afd7810";
    const EXPECTED_SHA256: &str =
        "4d508ff0e16484434de8ed6a602787e62bfeeeda40cf0304656a0c918e2d0ad3";

    fn pki_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test_data/pki")
    }

    fn make_identity() -> ServiceIdentity {
        ServiceIdentity {
            name: "InvAdmin".to_string(),
            client_id: "client-001".to_string(),
            resource_id: "urn:k1s0:inventory".to_string(),
            private_key_file: "inventory-admin.key.pem".to_string(),
            certificate_file: "inventory-admin.crt.pem".to_string(),
            base_url: "https://inventory.example.com".to_string(),
            token_endpoint: "https://auth.example.com/token".to_string(),
            audience: None,
        }
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let der = b"fixed certificate bytes";
        let first = fingerprint(der, FingerprintAlgorithm::Sha1);
        let second = fingerprint(der, FingerprintAlgorithm::Sha1);
        assert_eq!(first, second);
        assert_eq!(first.len(), 40);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_fingerprint_known_answer_sha1() {
        let store = KeyStore::new(pki_dir(), FingerprintAlgorithm::Sha1);
        let material = store.load(&make_identity()).unwrap();
        assert_eq!(material.kid, EXPECTED_SHA1);
    }

    #[test]
    fn test_fingerprint_known_answer_sha256() {
        let store = KeyStore::new(pki_dir(), FingerprintAlgorithm::Sha256);
        let material = store.load(&make_identity()).unwrap();
        assert_eq!(material.kid, EXPECTED_SHA256);
    }

    #[test]
    fn test_debug_output_masks_private_key() {
        let store = KeyStore::new(pki_dir(), FingerprintAlgorithm::Sha1);
        let material = store.load(&make_identity()).unwrap();

        let debug = format!("{material:?}");
        assert!(debug.contains(EXPECTED_SHA1));
        assert!(!debug.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_load_missing_key_file() {
        let store = KeyStore::new(pki_dir(), FingerprintAlgorithm::Sha1);
        let mut identity = make_identity();
        identity.private_key_file = "does-not-exist.pem".to_string();

        let err = store.load(&identity).unwrap_err();
        assert!(matches!(err, BrokerError::KeyNotFound { .. }));
    }

    #[test]
    fn test_load_rejects_parent_dir_traversal() {
        let store = KeyStore::new(pki_dir(), FingerprintAlgorithm::Sha1);
        let mut identity = make_identity();
        identity.private_key_file = "../pki/inventory-admin.key.pem".to_string();

        let err = store.load(&identity).unwrap_err();
        assert!(matches!(err, BrokerError::KeyNotFound { .. }));
    }

    #[test]
    fn test_load_rejects_absolute_path() {
        let store = KeyStore::new(pki_dir(), FingerprintAlgorithm::Sha1);
        let mut identity = make_identity();
        identity.private_key_file = pki_dir()
            .join("inventory-admin.key.pem")
            .display()
            .to_string();

        let err = store.load(&identity).unwrap_err();
        assert!(matches!(err, BrokerError::KeyNotFound { .. }));
    }

    #[test]
    fn test_load_malformed_certificate() {
        let store = KeyStore::new(pki_dir(), FingerprintAlgorithm::Sha1);
        let mut identity = make_identity();
        identity.certificate_file = "broken.crt.pem".to_string();

        let err = store.load(&identity).unwrap_err();
        assert!(matches!(err, BrokerError::KeyFormatInvalid { .. }));
    }

    #[test]
    fn test_load_non_rsa_private_key() {
        let store = KeyStore::new(pki_dir(), FingerprintAlgorithm::Sha1);
        let mut identity = make_identity();
        identity.private_key_file = "ec-only.key.pem".to_string();

        let err = store.load(&identity).unwrap_err();
        assert!(matches!(err, BrokerError::KeyTypeUnsupported { .. }));
    }

    #[test]
    fn test_load_is_cached_per_identity() {
        let store = KeyStore::new(pki_dir(), FingerprintAlgorithm::Sha1);
        let identity = make_identity();

        let first = store.load(&identity).unwrap();
        let second = store.load(&identity).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_invalidate_forces_reload() {
        let store = KeyStore::new(pki_dir(), FingerprintAlgorithm::Sha1);
        let identity = make_identity();

        let first = store.load(&identity).unwrap();
        store.invalidate(&identity.name);
        let second = store.load(&identity).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.kid, second.kid);
    }
}
