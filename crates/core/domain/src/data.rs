/// 读数解析错误（仅在发布循环内部恢复，不向外传播）。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("empty reading")]
    Empty,
    #[error("not a number: {0}")]
    NotANumber(String),
    #[error("non-finite value: {0}")]
    NonFinite(String),
}

/// 数据源单次采样得到的原始读数。
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// 读数名称（测点 / 文件 / 远端标识）
    pub name: String,
    /// 数据源内的轮询序号（fixture 回绕后从 0 重新开始）
    pub index: u64,
    /// 原始文本
    pub raw: String,
    pub read_at_ms: i64,
}

impl Reading {
    pub fn new(name: impl Into<String>, index: u64, raw: impl Into<String>, read_at_ms: i64) -> Self {
        Self {
            name: name.into(),
            index,
            raw: raw.into(),
            read_at_ms,
        }
    }

    /// 按数值解析原始文本。
    pub fn parse_f64(&self) -> Result<f64, ParseError> {
        let text = self.raw.trim();
        if text.is_empty() {
            return Err(ParseError::Empty);
        }
        let value = text
            .parse::<f64>()
            .map_err(|_| ParseError::NotANumber(text.to_string()))?;
        if !value.is_finite() {
            return Err(ParseError::NonFinite(text.to_string()));
        }
        Ok(value)
    }
}

/// 信封 Payload 中单个字段的值。
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadValue {
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
    /// 结构化值，字段顺序即输出顺序
    Object(Vec<(String, PayloadValue)>),
}

impl From<f64> for PayloadValue {
    fn from(value: f64) -> Self {
        Self::F64(value)
    }
}

impl From<i64> for PayloadValue {
    fn from(value: i64) -> Self {
        Self::I64(value)
    }
}

impl From<bool> for PayloadValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}
