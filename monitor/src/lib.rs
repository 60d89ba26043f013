//! Command-line arguments, formatting and negotiation for the Rotonde monitor.

use anyhow::{Context, Result};
use clap::Parser;
use rotonde_client::{handler, BootstrapRequest, ClientConfig, RotondeClient, DEFAULT_URL};
use rotonde_types::{Definition, Event, WILDCARD};
use serde_json::Value;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug, Clone)]
#[command(name = "rotonde-monitor")]
#[command(about = "Watches a Rotonde bus and negotiates actions")]
pub struct Args {
    /// Bus endpoint
    #[arg(short, long, default_value = DEFAULT_URL)]
    pub url: String,

    /// Event identifier to subscribe to and log (repeatable)
    #[arg(short, long = "event", value_name = "ID")]
    pub events: Vec<String>,

    /// Remote definition that must arrive before anything is sent (repeatable)
    #[arg(short, long = "require", value_name = "ID")]
    pub require: Vec<String>,

    /// Action to send once its schema is known, as ID=JSON (repeatable)
    #[arg(short, long = "action", value_name = "ID=JSON", value_parser = parse_action)]
    pub actions: Vec<(String, Value)>,

    /// Event awaited after the actions are sent (repeatable)
    #[arg(short = 'x', long = "expect", value_name = "ID")]
    pub expect: Vec<String>,

    /// Timeout for every wait, in milliseconds
    #[arg(short, long, default_value = "5000")]
    pub timeout_ms: u64,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            url: self.url.clone(),
            timeout_ms: self.timeout_ms,
        }
    }

    /// The bootstrap to run, or `None` without actions and expected events.
    pub fn bootstrap_request(&self) -> Option<BootstrapRequest> {
        if self.actions.is_empty() && self.expect.is_empty() {
            return None;
        }
        let request = self
            .actions
            .iter()
            .fold(BootstrapRequest::new(), |request, (identifier, data)| {
                request.action(identifier.clone(), data.clone())
            });
        let request = self
            .expect
            .iter()
            .fold(request, |request, identifier| request.expect_event(identifier.clone()));
        Some(request.timeout(self.timeout()))
    }
}

/// Parses `ID=JSON`. A bare `ID` sends `null`.
pub fn parse_action(raw: &str) -> Result<(String, Value), String> {
    let (identifier, data) = match raw.split_once('=') {
        Some((identifier, data)) => {
            let data = serde_json::from_str(data)
                .map_err(|e| format!("invalid JSON for action {identifier}: {e}"))?;
            (identifier, data)
        }
        None => (raw, Value::Null),
    };
    let identifier = identifier.trim();
    if identifier.is_empty() {
        return Err("action identifier is empty".to_string());
    }
    Ok((identifier.to_string(), data))
}

pub fn format_event(event: &Event) -> String {
    format!("event {} {}", event.identifier, event.data)
}

pub fn format_definition(definition: &Definition) -> String {
    let fields: Vec<String> = definition
        .fields
        .iter()
        .map(|field| {
            if field.unit.is_empty() {
                format!("{}:{}", field.name, field.field_type)
            } else {
                format!("{}:{}[{}]", field.name, field.field_type, field.unit)
            }
        })
        .collect();
    let array = if definition.is_array { "[]" } else { "" };
    format!(
        "{} {}{} ({})",
        definition.category,
        definition.identifier,
        array,
        fields.join(", ")
    )
}

/// Logs every event in `args.events` and every definition change.
pub fn attach_loggers(client: &RotondeClient, args: &Args) {
    for identifier in &args.events {
        client.event_handlers().attach(
            identifier.clone(),
            handler(|event: &Event| info!("{}", format_event(event))),
        );
    }
    client.definition_handlers().attach(
        WILDCARD,
        handler(|definition: &Definition| info!("def {}", format_definition(definition))),
    );
    client.undefinition_handlers().attach(
        WILDCARD,
        handler(|definition: &Definition| info!("undef {}", format_definition(definition))),
    );
}

/// Waits for the required definitions, then runs the bootstrap if one was
/// requested. Returns the awaited events.
pub async fn negotiate(client: &RotondeClient, args: &Args) -> Result<Vec<Event>> {
    if !args.require.is_empty() {
        client
            .require_definitions(args.require.clone(), args.timeout())
            .await
            .context("Required definitions did not arrive")?;
        info!("All required definitions received");
    }

    match args.bootstrap_request() {
        Some(request) => client.bootstrap(request).await.context("Bootstrap failed"),
        None => Ok(Vec::new()),
    }
}
