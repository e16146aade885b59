//! クライアントアサーション認証のエラー定義。

use thiserror::Error;

/// BrokerError はアサーション認証ブローカーで発生するエラーを表す。
///
/// どのサービスアイデンティティで失敗したかを全バリアントが保持するため、
/// 呼び出し側はエラー種別を解釈せずにそのままログ出力できる。
#[derive(Debug, Error)]
pub enum BrokerError {
    /// 鍵または証明書ファイルが見つからない（パストラバーサル拒否を含む）。
    #[error("鍵ファイルが見つかりません [{service}]: {path}")]
    KeyNotFound { service: String, path: String },

    /// PEM / DER のデコードに失敗した。
    #[error("鍵・証明書の形式が不正です [{service}]: {detail}")]
    KeyFormatInvalid { service: String, detail: String },

    /// RSA 以外の鍵アルゴリズムが指定された。
    #[error("サポートされない鍵種別です [{service}]: {detail}")]
    KeyTypeUnsupported { service: String, detail: String },

    /// アサーションの署名に失敗した。
    #[error("アサーションの署名に失敗しました [{service}]: {detail}")]
    SigningFailed { service: String, detail: String },

    /// HTTP トランスポートレベルの失敗。
    #[error("HTTP リクエスト失敗 [{service}]: {detail}")]
    Network { service: String, detail: String },

    /// ネットワーク呼び出しがデッドラインを超過した。
    #[error("リクエストがタイムアウトしました [{service}]")]
    Timeout { service: String },

    /// トークンエンドポイントが 2xx 以外を返した。
    #[error("トークンエンドポイントがエラーを返しました [{service}]: HTTP {status} - {body}")]
    TokenEndpoint {
        service: String,
        status: u16,
        body: String,
    },

    /// レスポンスボディが JSON として解析できない、または `access_token` を欠く。
    #[error("レスポンスの解析に失敗しました [{service}]: {detail}")]
    ResponseDecode { service: String, detail: String },

    /// ダウンストリームサービスが 2xx / 401 以外を返した。
    #[error("ダウンストリームがエラーを返しました [{service}]: HTTP {status} - {body}")]
    RequestFailed {
        service: String,
        status: u16,
        body: String,
    },

    /// トークン再取得後も 401 が返された（これ以上リトライしない）。
    #[error("認証が拒否されました（トークン再取得後も 401）[{service}]")]
    AuthenticationRejected { service: String },

    /// 設定に存在しないサービス名が指定された。
    #[error("サービスが設定に存在しません: {0}")]
    UnknownService(String),
}
