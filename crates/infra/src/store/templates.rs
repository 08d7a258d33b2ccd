//! Template store trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use ticketflow_core::{DomainError, TemplateId};
use ticketflow_tickets::Template;

use super::StoreError;

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn insert(&self, template: Template) -> Result<(), StoreError>;

    async fn get(&self, id: TemplateId) -> Result<Option<Template>, StoreError>;

    /// All templates, oldest first.
    async fn list(&self) -> Result<Vec<Template>, StoreError>;

    /// Overwrite subject/body. Locked templates are refused.
    async fn update(&self, template: &Template) -> Result<(), StoreError>;

    /// Freeze the template; idempotent. Returns the locked template.
    async fn lock(&self, id: TemplateId) -> Result<Template, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryTemplateStore {
    templates: RwLock<HashMap<TemplateId, Template>>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn insert(&self, template: Template) -> Result<(), StoreError> {
        let mut templates = self
            .templates
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if templates.contains_key(&template.id) {
            return Err(StoreError::AlreadyExists(template.id.to_string()));
        }
        templates.insert(template.id, template);
        Ok(())
    }

    async fn get(&self, id: TemplateId) -> Result<Option<Template>, StoreError> {
        let templates = self.templates.read().unwrap_or_else(PoisonError::into_inner);
        Ok(templates.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Template>, StoreError> {
        let templates = self.templates.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<Template> = templates.values().cloned().collect();
        all.sort_by_key(|t| (t.created_at, t.id));
        Ok(all)
    }

    async fn update(&self, template: &Template) -> Result<(), StoreError> {
        let mut templates = self
            .templates
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let stored = templates.get_mut(&template.id).ok_or(StoreError::NotFound)?;
        if stored.locked {
            return Err(DomainError::conflict("template is locked").into());
        }
        stored.subject = template.subject.clone();
        stored.body = template.body.clone();
        Ok(())
    }

    async fn lock(&self, id: TemplateId) -> Result<Template, StoreError> {
        let mut templates = self
            .templates
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let stored = templates.get_mut(&id).ok_or(StoreError::NotFound)?;
        stored.lock();
        Ok(stored.clone())
    }
}
