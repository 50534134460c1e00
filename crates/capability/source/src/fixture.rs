use crate::{DataSource, SourceError, now_epoch_ms};
use async_trait::async_trait;
use domain::Reading;
use std::path::Path;
use tracing::info;

/// 有限 fixture 数据源，读完后从第一条重新开始。
#[derive(Debug, Clone)]
pub struct FixtureSource {
    name: String,
    lines: Vec<String>,
    position: usize,
}

impl FixtureSource {
    /// 由内存中的行构造。
    pub fn from_lines<I, S>(name: impl Into<String>, lines: I) -> Result<Self, SourceError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        if lines.is_empty() {
            return Err(SourceError::Empty(name));
        }
        Ok(Self {
            name,
            lines,
            position: 0,
        })
    }

    /// 读取文件，每行一条读数。
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await?;
        let source = Self::from_lines(path.display().to_string(), text.lines())?;
        info!(
            target: "pubsub.source",
            path = %path.display(),
            entries = source.len(),
            "fixture_loaded"
        );
        Ok(source)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// 下一次轮询将返回的条目序号。
    pub fn position(&self) -> usize {
        self.position
    }
}

#[async_trait]
impl DataSource for FixtureSource {
    async fn next_reading(&mut self) -> Result<Reading, SourceError> {
        if self.position >= self.lines.len() {
            self.position = 0;
        }
        let index = self.position;
        self.position += 1;
        Ok(Reading::new(
            self.name.clone(),
            index as u64,
            self.lines[index].clone(),
            now_epoch_ms(),
        ))
    }
}
