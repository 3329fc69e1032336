//! Mail notification payloads and the queue handlers that deliver them.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::rabbitmq::{Delivery, Handler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoEventType {
    CreateTodo,
    UpdateTodo,
    DeleteTodo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserEventType {
    #[serde(rename = "user_verify_email")]
    VerifyEmail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoMailItem {
    pub todo_event_type: TodoEventType,
    pub receivers: Vec<String>,
    pub assignee_name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMailItem {
    pub user_event_type: UserEventType,
    pub receivers: Vec<String>,
    pub link: String,
}

/// A rendered mail ready for a [`Notifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub receivers: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl TodoMailItem {
    pub fn to_mail(&self) -> Mail {
        let (subject, body) = match self.todo_event_type {
            TodoEventType::CreateTodo => (
                "A new TODO has been created",
                format!(
                    "A new TODO has been created!\n\nDescription: {}\nAssignee: {}",
                    self.description, self.assignee_name
                ),
            ),
            TodoEventType::UpdateTodo => (
                "Your TODO has been changed",
                format!(
                    "Your TODO has been changed!\n\nDescription: {}\nAssignee: {}",
                    self.description, self.assignee_name
                ),
            ),
            TodoEventType::DeleteTodo => (
                "Your TODO has been deleted",
                format!("Your TODO has been deleted!\n\nDescription: {}", self.description),
            ),
        };

        Mail {
            receivers: self.receivers.clone(),
            subject: subject.to_string(),
            body,
        }
    }
}

impl UserMailItem {
    pub fn to_mail(&self) -> Mail {
        match self.user_event_type {
            UserEventType::VerifyEmail => Mail {
                receivers: self.receivers.clone(),
                subject: "Verify email".to_string(),
                body: format!(
                    "Thank you for registering.\nPlease verify your email address: {}",
                    self.link
                ),
            },
        }
    }
}

/// Outbound mail transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, mail: &Mail) -> anyhow::Result<()>;
}

/// Writes mails to the log instead of sending them.
#[derive(Debug, Default, Clone)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send(&self, mail: &Mail) -> anyhow::Result<()> {
        info!(
            subject = %mail.subject,
            receivers = ?mail.receivers,
            "Sending mail"
        );
        Ok(())
    }
}

pub struct UsersMessagesHandler {
    notifier: Arc<dyn Notifier>,
}

impl UsersMessagesHandler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl Handler for UsersMessagesHandler {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        info!(request_id = delivery.request_id().unwrap_or_default(), "Received user message");

        let item: UserMailItem = delivery.json().context("unmarshalling user message")?;
        self.notifier
            .send(&item.to_mail())
            .await
            .context("sending user mail")?;

        delivery.ack().await?;
        Ok(())
    }
}

pub struct TodoMessagesHandler {
    notifier: Arc<dyn Notifier>,
}

impl TodoMessagesHandler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl Handler for TodoMessagesHandler {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        info!(request_id = delivery.request_id().unwrap_or_default(), "Received todo message");

        let item: TodoMailItem = delivery.json().context("unmarshalling todo message")?;
        self.notifier
            .send(&item.to_mail())
            .await
            .context("sending todo mail")?;

        delivery.ack().await?;
        Ok(())
    }
}
