use async_trait::async_trait;
use crate::core::{AuxCommand, AuxDevice, Pose};
use crate::hardware::actuator::{
    Actuator, ActuatorError, ActuatorResult, AuxReport, Health, PoseReport, RemoteConfig,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

/// `/set_state` answer as far as the fan is concerned
#[derive(Debug, Default, Deserialize)]
struct StateReply {
    #[serde(default)]
    fan_running: Option<bool>,
}

/// Controller reached over HTTP/JSON
///
/// The Pi firmware serves three paths:
/// - `GET /health`
/// - `POST /set_state` with `{"state": "DIP"}`, also used for `OPEN` (home),
///   `BLOW` (toggles the fan) and `IDLE` (stops everything)
/// - `POST /update_config` with the camelCase config object
///
/// The fogger is not wired to the Pi. Its commands go to `POST /aux` with
/// `{"device": "fogger", "command": "start", "intensity": 80}`, which only a
/// controller with a smoke machine attached answers.
///
/// No request timeout is set: a move takes as long as it takes. Liveness
/// probes are bounded by the caller.
pub struct HttpActuator {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpActuator {
    /// Create a client for the controller at `base_url` (e.g. `http://bubblebot.local:5000`)
    pub fn new(base_url: &str) -> ActuatorResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("bubblebot/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: &str, client: reqwest::Client) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        debug!("Creating HttpActuator for {}", base_url);
        Self {
            name: base_url.clone(),
            base_url,
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(&self, path: &str, body: &B) -> ActuatorResult<R> {
        debug!("POST {}", path);
        let response = self.client.post(self.url(path)).json(body).send().await?;
        Self::decode(response).await
    }

    async fn set_state<R: DeserializeOwned>(&self, state: &str) -> ActuatorResult<R> {
        self.post("/set_state", &json!({ "state": state })).await
    }

    /// Drive the fan through the `BLOW` toggle until it lands on `running`
    ///
    /// Firmware that does not report `fan_running` starts the fan on `BLOW`
    /// and stops it on `IDLE`. Fan speed comes from the pushed config.
    async fn set_blower(&self, running: bool) -> ActuatorResult<AuxReport> {
        let reply: StateReply = self.set_state("BLOW").await?;
        match reply.fan_running {
            Some(now) if now == running => Ok(AuxReport { running: Some(now) }),
            Some(_) => {
                debug!("Fan toggled the wrong way, toggling back");
                let reply: StateReply = self.set_state("BLOW").await?;
                match reply.fan_running {
                    Some(now) if now != running => Err(ActuatorError::Rejected(format!(
                        "fan still {} after two toggles",
                        if now { "running" } else { "stopped" }
                    ))),
                    now => Ok(AuxReport { running: now.or(Some(running)) }),
                }
            }
            None if running => Ok(AuxReport { running: Some(true) }),
            None => {
                let _: StateReply = self.set_state("IDLE").await?;
                Ok(AuxReport { running: Some(false) })
            }
        }
    }

    /// Check status and `success` flag, then parse the body
    async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> ActuatorResult<R> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ActuatorError::Status {
                code: status.as_u16(),
                body,
            });
        }

        let value: Value = if body.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&body).map_err(|e| ActuatorError::Decode(e.to_string()))?
        };

        if value.get("success").and_then(Value::as_bool) == Some(false) {
            let reason = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("command failed")
                .to_string();
            return Err(ActuatorError::Rejected(reason));
        }

        serde_json::from_value(value).map_err(|e| ActuatorError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Actuator for HttpActuator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> ActuatorResult<Health> {
        let response = self.client.get(self.url("/health")).send().await?;
        Self::decode(response).await
    }

    async fn set_pose(&self, pose: Pose) -> ActuatorResult<PoseReport> {
        self.set_state(pose.as_str()).await
    }

    async fn set_aux(
        &self,
        device: AuxDevice,
        command: AuxCommand,
        intensity: Option<u8>,
    ) -> ActuatorResult<AuxReport> {
        if device == AuxDevice::Blower {
            return self.set_blower(command.running()).await;
        }
        let mut body = json!({
            "device": device.as_str(),
            "command": command.as_str(),
        });
        if let Some(intensity) = intensity {
            body["intensity"] = json!(intensity);
        }
        self.post("/aux", &body).await
    }

    async fn push_config(&self, config: &RemoteConfig) -> ActuatorResult<()> {
        let _: Value = self.post("/update_config", config).await?;
        Ok(())
    }

    async fn home(&self) -> ActuatorResult<PoseReport> {
        self.set_pose(Pose::HOME).await
    }
}
