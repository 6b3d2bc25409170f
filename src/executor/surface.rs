//! Capability surface the executor acts on.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

/// Document-like target: element interaction by selector.
#[async_trait]
pub trait Surface: Send + Sync {
    async fn click(&self, selector: &str) -> anyhow::Result<()>;
    async fn fill(&self, selector: &str, value: &str) -> anyhow::Result<()>;
    async fn read(&self, selector: &str) -> anyhow::Result<String>;
    async fn extract(&self, selector: &str, attribute: Option<&str>) -> anyhow::Result<serde_json::Value>;
    async fn scroll(&self, selector: Option<&str>, dy: i64) -> anyhow::Result<()>;
}

/// Navigation capability.
#[async_trait]
pub trait Navigator: Send + Sync {
    async fn navigate(&self, url: &str) -> anyhow::Result<()>;
}

/// A fake page held in memory: selectors map to text, and every primitive
/// call is recorded. Used by the demo binary and tests.
#[derive(Debug, Default)]
pub struct InMemorySurface {
    elements: Mutex<HashMap<String, String>>,
    location: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
}

impl InMemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_element(self, selector: impl Into<String>, text: impl Into<String>) -> Self {
        self.elements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(selector.into(), text.into());
        self
    }

    /// Primitive calls made so far, e.g. `"click #go"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn location(&self) -> Option<String> {
        self.location.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
    }

    fn element(&self, selector: &str) -> anyhow::Result<String> {
        self.elements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(selector)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no element matches '{selector}'"))
    }
}

#[async_trait]
impl Surface for InMemorySurface {
    async fn click(&self, selector: &str) -> anyhow::Result<()> {
        self.element(selector)?;
        self.record(format!("click {selector}"));
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> anyhow::Result<()> {
        self.element(selector)?;
        self.elements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(selector.to_string(), value.to_string());
        self.record(format!("fill {selector}"));
        Ok(())
    }

    async fn read(&self, selector: &str) -> anyhow::Result<String> {
        let text = self.element(selector)?;
        self.record(format!("read {selector}"));
        Ok(text)
    }

    async fn extract(&self, selector: &str, attribute: Option<&str>) -> anyhow::Result<serde_json::Value> {
        let text = self.element(selector)?;
        self.record(format!("extract {selector}"));
        Ok(match attribute {
            Some(attr) => {
                let mut map = serde_json::Map::new();
                map.insert(attr.to_string(), serde_json::Value::String(text));
                serde_json::Value::Object(map)
            }
            None => serde_json::Value::String(text),
        })
    }

    async fn scroll(&self, selector: Option<&str>, dy: i64) -> anyhow::Result<()> {
        self.record(format!("scroll {} {dy}", selector.unwrap_or("page")));
        Ok(())
    }
}

#[async_trait]
impl Navigator for InMemorySurface {
    async fn navigate(&self, url: &str) -> anyhow::Result<()> {
        *self.location.lock().unwrap_or_else(|e| e.into_inner()) = Some(url.to_string());
        self.record(format!("navigate {url}"));
        Ok(())
    }
}
