/// エラー伝搬用の型。main関数などで利用
pub type DynError = Box<dyn std::error::Error + 'static>;
