//! 作用域式 JSON 编码器。
//!
//! 报文按调用顺序逐字段写出，字段顺序即输出顺序。每个 `push_*` 必须有对应的
//! `pop_*`，且按打开顺序的逆序关闭；`close_and_return_text` 在仍有未关闭作用域时失败。

use crate::EncodeError;
use domain::PayloadValue;

/// Variant 值的编码方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VariantEncoding {
    /// 可逆编码：`{"Type": <内置类型编号>, "Body": <值>}`
    #[default]
    Reversible,
    /// 直接输出值本身
    Plain,
}

/// 内置类型编号（可逆编码使用）。
const TYPE_BOOLEAN: u8 = 1;
const TYPE_INT64: u8 = 8;
const TYPE_DOUBLE: u8 = 11;
const TYPE_STRING: u8 = 12;
const TYPE_STRUCTURE: u8 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Structure,
    Array,
}

impl ScopeKind {
    fn name(self) -> &'static str {
        match self {
            ScopeKind::Structure => "structure",
            ScopeKind::Array => "array",
        }
    }
}

#[derive(Debug)]
struct Scope {
    kind: ScopeKind,
    empty: bool,
}

/// 流式 JSON 编码器（根作用域为结构体，创建时即打开）。
#[derive(Debug)]
pub struct JsonEncoder {
    buffer: String,
    scopes: Vec<Scope>,
    encoding: VariantEncoding,
}

impl JsonEncoder {
    pub fn new(encoding: VariantEncoding) -> Self {
        let mut buffer = String::with_capacity(256);
        buffer.push('{');
        Self {
            buffer,
            scopes: vec![Scope {
                kind: ScopeKind::Structure,
                empty: true,
            }],
            encoding,
        }
    }

    /// 当前打开的作用域数量（含根结构体）。
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn push_structure(&mut self, field: Option<&str>) -> Result<(), EncodeError> {
        self.begin_member(field)?;
        self.buffer.push('{');
        self.scopes.push(Scope {
            kind: ScopeKind::Structure,
            empty: true,
        });
        Ok(())
    }

    pub fn pop_structure(&mut self) -> Result<(), EncodeError> {
        self.end_scope(ScopeKind::Structure)?;
        self.buffer.push('}');
        Ok(())
    }

    pub fn push_array(&mut self, field: Option<&str>) -> Result<(), EncodeError> {
        self.begin_member(field)?;
        self.buffer.push('[');
        self.scopes.push(Scope {
            kind: ScopeKind::Array,
            empty: true,
        });
        Ok(())
    }

    pub fn pop_array(&mut self) -> Result<(), EncodeError> {
        self.end_scope(ScopeKind::Array)?;
        self.buffer.push(']');
        Ok(())
    }

    pub fn write_string(&mut self, field: Option<&str>, value: &str) -> Result<(), EncodeError> {
        self.begin_member(field)?;
        self.push_json_string(value)
    }

    pub fn write_variant(
        &mut self,
        field: Option<&str>,
        value: &PayloadValue,
    ) -> Result<(), EncodeError> {
        match self.encoding {
            VariantEncoding::Plain => {
                self.begin_member(field)?;
                self.write_raw_value(value)
            }
            VariantEncoding::Reversible => {
                self.push_structure(field)?;
                self.begin_member(Some("Type"))?;
                self.buffer.push_str(&type_id(value).to_string());
                self.begin_member(Some("Body"))?;
                self.write_raw_value(value)?;
                self.pop_structure()
            }
        }
    }

    /// 关闭根作用域并返回完整文本。
    pub fn close_and_return_text(mut self) -> Result<String, EncodeError> {
        if self.scopes.len() != 1 {
            return Err(EncodeError::UnclosedScopes(self.scopes.len() - 1));
        }
        self.scopes.clear();
        self.buffer.push('}');
        Ok(self.buffer)
    }

    fn write_raw_value(&mut self, value: &PayloadValue) -> Result<(), EncodeError> {
        match value {
            PayloadValue::Bool(v) => {
                self.buffer.push_str(if *v { "true" } else { "false" });
                Ok(())
            }
            PayloadValue::I64(v) => {
                self.buffer.push_str(&v.to_string());
                Ok(())
            }
            PayloadValue::F64(v) => self.push_double(*v),
            PayloadValue::String(v) => self.push_json_string(v),
            PayloadValue::Object(fields) => {
                self.buffer.push('{');
                self.scopes.push(Scope {
                    kind: ScopeKind::Structure,
                    empty: true,
                });
                for (name, field) in fields {
                    self.write_variant(Some(name), field)?;
                }
                self.pop_structure()
            }
        }
    }

    fn push_double(&mut self, value: f64) -> Result<(), EncodeError> {
        // JSON 无法表示非有限数，按字符串输出
        if value.is_nan() {
            return self.push_json_string("NaN");
        }
        if value.is_infinite() {
            let text = if value > 0.0 { "Infinity" } else { "-Infinity" };
            return self.push_json_string(text);
        }
        let text = serde_json::to_string(&value)?;
        self.buffer.push_str(&text);
        Ok(())
    }

    fn push_json_string(&mut self, value: &str) -> Result<(), EncodeError> {
        let text = serde_json::to_string(value)?;
        self.buffer.push_str(&text);
        Ok(())
    }

    fn begin_member(&mut self, field: Option<&str>) -> Result<(), EncodeError> {
        let scope = self.scopes.last_mut().ok_or(EncodeError::Closed)?;
        match (scope.kind, field) {
            (ScopeKind::Structure, None) => return Err(EncodeError::MissingFieldName),
            (ScopeKind::Array, Some(name)) => {
                return Err(EncodeError::UnexpectedFieldName(name.to_string()));
            }
            _ => {}
        }
        if !scope.empty {
            self.buffer.push(',');
        }
        scope.empty = false;
        if let Some(name) = field {
            let key = serde_json::to_string(name)?;
            self.buffer.push_str(&key);
            self.buffer.push(':');
        }
        Ok(())
    }

    fn end_scope(&mut self, expected: ScopeKind) -> Result<(), EncodeError> {
        if self.scopes.len() <= 1 {
            return Err(EncodeError::ScopeUnderflow);
        }
        let found = self.scopes.last().map(|scope| scope.kind).ok_or(EncodeError::Closed)?;
        if found != expected {
            return Err(EncodeError::ScopeMismatch {
                expected: expected.name(),
                found: found.name(),
            });
        }
        self.scopes.pop();
        Ok(())
    }
}

fn type_id(value: &PayloadValue) -> u8 {
    match value {
        PayloadValue::Bool(_) => TYPE_BOOLEAN,
        PayloadValue::I64(_) => TYPE_INT64,
        PayloadValue::F64(_) => TYPE_DOUBLE,
        PayloadValue::String(_) => TYPE_STRING,
        PayloadValue::Object(_) => TYPE_STRUCTURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_encoder_closes_to_object() {
        let encoder = JsonEncoder::new(VariantEncoding::Plain);
        assert_eq!(encoder.close_and_return_text().expect("text"), "{}");
    }

    #[test]
    fn unclosed_scope_fails_finalize() {
        let mut encoder = JsonEncoder::new(VariantEncoding::Plain);
        encoder.push_array(Some("Messages")).expect("array");
        encoder.push_structure(None).expect("structure");
        let err = encoder.close_and_return_text().expect_err("unclosed");
        assert!(matches!(err, EncodeError::UnclosedScopes(2)));
    }

    #[test]
    fn mismatched_pop_is_rejected() {
        let mut encoder = JsonEncoder::new(VariantEncoding::Plain);
        encoder.push_array(Some("Messages")).expect("array");
        let err = encoder.pop_structure().expect_err("mismatch");
        assert!(matches!(
            err,
            EncodeError::ScopeMismatch {
                expected: "structure",
                found: "array"
            }
        ));
    }

    #[test]
    fn root_cannot_be_popped() {
        let mut encoder = JsonEncoder::new(VariantEncoding::Plain);
        assert!(matches!(
            encoder.pop_structure(),
            Err(EncodeError::ScopeUnderflow)
        ));
    }

    #[test]
    fn field_names_follow_scope_kind() {
        let mut encoder = JsonEncoder::new(VariantEncoding::Plain);
        assert!(matches!(
            encoder.write_string(None, "x"),
            Err(EncodeError::MissingFieldName)
        ));
        encoder.push_array(Some("Items")).expect("array");
        assert!(matches!(
            encoder.write_string(Some("Name"), "x"),
            Err(EncodeError::UnexpectedFieldName(_))
        ));
    }

    #[test]
    fn reversible_variant_wraps_type_and_body() {
        let mut encoder = JsonEncoder::new(VariantEncoding::Reversible);
        encoder
            .write_variant(Some("Energy"), &PayloadValue::F64(12.5))
            .expect("variant");
        encoder
            .write_variant(Some("Count"), &PayloadValue::I64(3))
            .expect("variant");
        let text = encoder.close_and_return_text().expect("text");
        assert_eq!(
            text,
            r#"{"Energy":{"Type":11,"Body":12.5},"Count":{"Type":8,"Body":3}}"#
        );
    }

    #[test]
    fn non_finite_doubles_are_written_as_strings() {
        let mut encoder = JsonEncoder::new(VariantEncoding::Plain);
        encoder
            .write_variant(Some("A"), &PayloadValue::F64(f64::NAN))
            .expect("nan");
        encoder
            .write_variant(Some("B"), &PayloadValue::F64(f64::NEG_INFINITY))
            .expect("inf");
        let text = encoder.close_and_return_text().expect("text");
        assert_eq!(text, r#"{"A":"NaN","B":"-Infinity"}"#);
    }
}
