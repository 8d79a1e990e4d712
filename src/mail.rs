//! Send emails to applicants for verification and account updates.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::uri::{
    AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo,
};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use serde::Serialize;
use url::Url;

use crate::config::Mail;

const DEFAULT_AMPQ_HOST: &str = "localhost";
const DEFAULT_AMPQ_PORT: u16 = 5672;
const DEFAULT_AMPQ_VHOST: &str = "/";

const CONTENT_ENCODING: &str = "utf8";
const CONTENT_TYPE: &str = "application/cloudevents+json";
const DATA_CONTENT_TYPE: &str = "application/json";
const CLOUDEVENT_VERSION: &str = "1.0";
const ID_LENGTH: usize = 12;

#[derive(thiserror::Error, Debug)]
pub enum MailError {
    #[error(transparent)]
    Amqp(#[from] lapin::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error("unknown AMQP scheme")]
    InvalidScheme,
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

/// Mail templates list.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    /// Carries the single-use verification link.
    VerifyEmail,
    /// Sent once the address is proven.
    Welcome,
    /// Carries the single-use password-reset link.
    PasswordReset,
}

/// Dispatch seam for the orchestrator.
///
/// Side-effect-only and fallible; no caller ever rolls back persisted state
/// because a send failed.
#[async_trait]
pub trait Notify: Send + Sync {
    async fn send(
        &self,
        template: Template,
        to: &str,
        context: serde_json::Value,
    ) -> Result<(), MailError>;
}

#[derive(Debug, Serialize)]
struct Cloudevent<'a> {
    specversion: &'static str,
    r#type: &'static str,
    source: &'static str,
    id: String,
    time: String,
    datacontenttype: &'static str,
    data: Content<'a>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    to: &'a str,
    template: Template,
    context: serde_json::Value,
}

/// RabbitMQ-backed mail gateway.
#[derive(Clone, Default)]
pub struct MailManager {
    queue: String,
    conn: Option<Arc<Connection>>,
}

impl MailManager {
    /// Create a new [`MailManager`].
    pub async fn new(config: &Mail) -> Result<Self, MailError> {
        let addr = Url::parse(&config.address)?;
        let uri = AMQPUri {
            scheme: AMQPScheme::from_str(addr.scheme())
                .map_err(|_| MailError::InvalidScheme)?,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: config.username.clone(),
                    password: config.password.clone(),
                },
                host: addr.host_str().unwrap_or(DEFAULT_AMPQ_HOST).into(),
                port: addr.port().unwrap_or(DEFAULT_AMPQ_PORT),
            },
            vhost: config
                .vhost
                .clone()
                .unwrap_or(DEFAULT_AMPQ_VHOST.to_string()),
            query: AMQPQueryString {
                channel_max: config.pool,
                ..Default::default()
            },
        };

        let conn_config = ConnectionProperties::default()
            .with_connection_name("matricula_mail_client".into());
        let conn = Connection::connect_uri(uri, conn_config).await?;

        tracing::info!(%addr, "rabbitmq connected");

        Ok(Self {
            queue: config.queue.clone(),
            conn: Some(Arc::new(conn)),
        })
    }

    async fn create_channel(
        conn: Arc<Connection>,
        queue: &str,
    ) -> Result<Channel, MailError> {
        let channel = conn.create_channel().await?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(channel)
    }

    fn create_event(data: Content) -> Cloudevent {
        let id = Alphanumeric.sample_string(&mut OsRng, ID_LENGTH);
        Cloudevent {
            specversion: CLOUDEVENT_VERSION,
            r#type: "edu.matricula.email",
            source: "edu.matricula.registration",
            id,
            time: Utc::now().to_rfc3339(),
            datacontenttype: DATA_CONTENT_TYPE,
            data,
        }
    }
}

#[async_trait]
impl Notify for MailManager {
    /// Publish a mail event for a recipient.
    async fn send(
        &self,
        template: Template,
        to: &str,
        context: serde_json::Value,
    ) -> Result<(), MailError> {
        let Some(conn) = &self.conn else {
            tracing::debug!(?template, "mail gateway not configured, event dropped");
            return Ok(());
        };
        let channel =
            Self::create_channel(Arc::clone(conn), &self.queue).await?;

        let content = Content {
            to,
            template,
            context,
        };
        let payload = Self::create_event(content);
        let payload = serde_json::to_string(&payload)?;

        channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                payload.as_bytes(),
                BasicProperties::default()
                    .with_content_encoding(CONTENT_ENCODING.into())
                    .with_content_type(CONTENT_TYPE.into()),
            )
            .await?;

        tracing::trace!(?template, "mail event sent");

        Ok(())
    }
}

/// Recording stub for tests. Optionally fails every send.
#[cfg(test)]
#[derive(Default)]
pub struct StubNotifier {
    pub fail: bool,
    pub sent: std::sync::Mutex<Vec<(Template, String)>>,
}

#[cfg(test)]
#[async_trait]
impl Notify for StubNotifier {
    async fn send(
        &self,
        template: Template,
        to: &str,
        _context: serde_json::Value,
    ) -> Result<(), MailError> {
        if self.fail {
            return Err(MailError::InvalidScheme);
        }
        self.sent.lock().unwrap().push((template, to.to_string()));
        Ok(())
    }
}
