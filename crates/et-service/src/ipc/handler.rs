//! Control command dispatch

use std::sync::Arc;

use et_core::error::EnrollmentError;
use et_core::ipc::{
    AddIdentity, Command, Event, EventAction, IdentityConfigInfo, IdentityInfo, Response,
    ResponseCode,
};
use et_core::types::{Address, Service};
use et_core::{Fingerprint, LogLevel, TunnelError};

use crate::identity::{IdentityManager, Toggle};
use crate::state::TunnelContext;

/// Response to send plus whether tunnel state changed and must be persisted
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub response: Response,
    pub mutated: bool,
}

impl Outcome {
    fn unchanged(response: Response) -> Self {
        Self {
            response,
            mutated: false,
        }
    }

    fn changed(response: Response) -> Self {
        Self {
            response,
            mutated: true,
        }
    }
}

/// Executes decoded control commands
#[derive(Clone)]
pub struct CommandHandler {
    ctx: Arc<TunnelContext>,
    manager: IdentityManager,
}

impl CommandHandler {
    pub fn new(ctx: Arc<TunnelContext>, manager: IdentityManager) -> Self {
        Self { ctx, manager }
    }

    /// Run every command except `AddIdentity`, which needs its second line
    /// and goes through [`add_identity`](Self::add_identity)
    pub async fn handle(&self, command: Command) -> Outcome {
        tracing::debug!("handling {} request", command.function());
        match command {
            Command::AddIdentity => Outcome::unchanged(Response::error(
                ResponseCode::ProtocolError,
                "AddIdentity requires an enrollment request line",
                "",
            )),
            Command::RemoveIdentity { fingerprint } => self.remove_identity(&fingerprint).await,
            Command::Status => {
                let status = self.ctx.to_status().await;
                Outcome::unchanged(Response::with_payload("status", &status))
            }
            Command::TunnelState { on_off } => self.tunnel_state(on_off).await,
            Command::IdentityOnOff {
                fingerprint,
                on_off,
            } => self.identity_on_off(&fingerprint, on_off).await,
            Command::SetLogLevel { level } => self.set_log_level(&level).await,
            Command::ZitiDump => self.dump().await,
            Command::Debug => {
                self.debug().await;
                Outcome::unchanged(Response {
                    error: "debug".to_string(),
                    ..Response::success("debug")
                })
            }
        }
    }

    pub async fn add_identity(&self, request: AddIdentity) -> Outcome {
        tracing::debug!("new identity for {:?}", request.id.name);
        match self.manager.enroll(request).await {
            Ok(identity) => Outcome::changed(Response::with_payload("success", &identity)),
            Err(e) => {
                let message = match &e {
                    TunnelError::Enrollment(EnrollmentError::InvalidToken(_)) => "failed to parse JWT",
                    TunnelError::Enrollment(EnrollmentError::Engine(_)) => "failed to enroll",
                    TunnelError::Enrollment(EnrollmentError::AlreadyEnrolled(_)) => {
                        "identity is already enrolled"
                    }
                    TunnelError::Enrollment(EnrollmentError::WriteFile(_)) => {
                        "Could not create the identity file in local storage"
                    }
                    TunnelError::Enrollment(EnrollmentError::Rename { .. }) => {
                        "a problem occurred while writing the identity file."
                    }
                    _ => "enrollment failed",
                };
                tracing::warn!("{}: {}", message, e);
                Outcome::unchanged(Response::error(e.code(), message, e.to_string()))
            }
        }
    }

    async fn remove_identity(&self, fingerprint: &Fingerprint) -> Outcome {
        match self.manager.remove(fingerprint).await {
            Ok(disconnect_error) => Outcome::changed(Response {
                error: disconnect_error.unwrap_or_default(),
                ..Response::success("success")
            }),
            Err(e @ TunnelError::NotFound(_)) => Outcome::unchanged(Response::error(
                e.code(),
                format!("Could not find identity by fingerprint: {}", fingerprint),
                e.to_string(),
            )),
            Err(e) => Outcome::unchanged(Response::error(
                e.code(),
                "failed to remove identity",
                e.to_string(),
            )),
        }
    }

    async fn tunnel_state(&self, on_off: bool) -> Outcome {
        match self.manager.set_tunnel_state(on_off).await {
            Ok(true) => Outcome::changed(Response::success("tunnel state updated successfully")),
            Ok(false) => Outcome::unchanged(Response::success(format!(
                "noop: tunnel state already set to {}",
                on_off
            ))),
            Err(e) => Outcome::unchanged(Response::error(
                e.code(),
                "failed to change tunnel state",
                e.to_string(),
            )),
        }
    }

    async fn identity_on_off(&self, fingerprint: &Fingerprint, on_off: bool) -> Outcome {
        match self.manager.toggle(fingerprint, on_off).await {
            Ok(Toggle::Toggled(identity)) => {
                Outcome::changed(Response::with_payload("identity toggled", &identity))
            }
            Ok(Toggle::Unchanged) => Outcome::unchanged(Response::success(format!(
                "no update performed. identity is already set to active={}",
                on_off
            ))),
            Err(e @ TunnelError::NotFound(_)) => {
                tracing::warn!("{}", e);
                Outcome::unchanged(Response::success(format!("no update performed. {}", e)))
            }
            Err(e) => Outcome::unchanged(Response::error(
                e.code(),
                "failed to toggle identity",
                e.to_string(),
            )),
        }
    }

    async fn set_log_level(&self, level: &str) -> Outcome {
        match self.ctx.set_log_level(LogLevel::parse(level)).await {
            Ok(()) => Outcome::changed(Response::success("log level set")),
            Err(e) => Outcome::unchanged(Response::error(
                e.code(),
                "failed to set log level",
                e.to_string(),
            )),
        }
    }

    /// Write the engine's diagnostics for every loaded identity to the log
    /// directory
    async fn dump(&self) -> Outcome {
        let engine = self.ctx.engine.as_ref();
        let dumps = self.ctx.registry.map_all(|identity| {
            let text = identity.handle().map(|handle| engine.dump(handle));
            (identity.name.clone(), text)
        });

        let log_dir = self.ctx.config.log_dir();
        if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
            tracing::warn!("could not create {:?}: {}", log_dir, e);
        }
        for (name, text) in dumps {
            let path = log_dir.join(format!("{}.ziti.txt", name));
            match text {
                None => continue,
                Some(Err(e)) => tracing::warn!("could not dump identity {}: {}", name, e),
                Some(Ok(text)) => {
                    if let Err(e) = tokio::fs::write(&path, text).await {
                        tracing::warn!("could not write {:?}: {}", path, e);
                    }
                }
            }
        }
        tracing::debug!("request to ZitiDump complete");
        Outcome::unchanged(Response::success("ZitiDump complete"))
    }

    /// Publish a status event and a synthetic identity added/removed pair
    async fn debug(&self) {
        let hub = &self.ctx.hub;
        hub.publish(Event::status(self.ctx.to_status().await)).await;

        let services = ["FakeService1", "Second Fake Service"]
            .iter()
            .enumerate()
            .map(|(i, name)| Service {
                id: format!("fake-{}", i + 1),
                name: name.to_string(),
                addresses: vec![Address::host(format!("fake{}.ziti", i + 1))],
                ..Default::default()
            })
            .collect();
        hub.publish(Event::Identity {
            action: EventAction::Added,
            id: IdentityInfo {
                name: "NewIdentity".to_string(),
                fingerprint: Fingerprint::new("new_id_fingerprint"),
                active: true,
                config: IdentityConfigInfo {
                    controller: "http://new_id.com:2123".to_string(),
                },
                services,
                ..Default::default()
            },
        })
        .await;
        hub.publish(Event::Identity {
            action: EventAction::Removed,
            id: IdentityInfo {
                fingerprint: Fingerprint::new("new_id_fingerprint"),
                ..Default::default()
            },
        })
        .await;
    }
}
