use std::path::{Path, PathBuf};
use std::sync::Arc;

use shears_contracts::conversation::{ConversationStore, ImagePayload, Turn};
use shears_contracts::errors::{GenerationError, GenerationResult};
use shears_contracts::events::{EventLog, SessionEvent};
use shears_contracts::generation::{GenerationRequest, GenerationResponsePart};
use tracing::warn;
use uuid::Uuid;

use crate::client::GenerationClient;

pub const DEFAULT_DOWNLOAD_NAME: &str = "refined_image";

/// Outcome of one successful action: the parts returned and the index of the
/// first turn they were appended at.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub first_turn: usize,
    pub parts: Vec<GenerationResponsePart>,
}

impl Exchange {
    pub fn images(&self) -> impl Iterator<Item = &ImagePayload> {
        self.parts.iter().filter_map(GenerationResponsePart::as_image)
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(GenerationResponsePart::as_text)
    }
}

/// Conversation state for one user session.
///
/// The client is shared and stateless; everything that changes lives here, so
/// sessions never see each other's turns. Failed actions leave the store as
/// it was.
pub struct Session {
    id: String,
    client: Arc<GenerationClient>,
    store: ConversationStore,
    last_request: Option<GenerationRequest>,
    events: Option<EventLog>,
}

impl Session {
    pub fn new(client: Arc<GenerationClient>, events_path: Option<PathBuf>) -> Self {
        let id = Uuid::new_v4().to_string();
        let events = events_path.map(|path| EventLog::new(path, id.clone()));
        let session = Self {
            id,
            client,
            store: ConversationStore::new(),
            last_request: None,
            events,
        };
        let config = session.client.config();
        session.emit(SessionEvent::SessionStarted {
            model: config.model.clone(),
            transport: session.client.transport_name().to_string(),
            max_image_dim: config.max_image_dim,
            features: config.features,
        });
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn client(&self) -> &GenerationClient {
        &self.client
    }

    pub fn last_request(&self) -> Option<&GenerationRequest> {
        self.last_request.as_ref()
    }

    /// Sends the user's text and images, then records the user turn and one
    /// assistant turn per returned part.
    pub fn submit(&mut self, request: GenerationRequest) -> GenerationResult<Exchange> {
        let user_turn = request.user_turn()?;
        self.run("generate", request, Some(user_turn))
    }

    /// Edits the most recent generated image with a new instruction.
    pub fn refine(&mut self, instruction: &str) -> GenerationResult<Exchange> {
        if !self.client.config().features.refine {
            return Err(GenerationError::FeatureDisabled("refine"));
        }
        let prior = self
            .store
            .last_generated_image()
            .cloned()
            .ok_or_else(|| GenerationError::invalid("there is no generated image to refine yet"))?;
        self.refine_image(&prior, instruction)
    }

    /// Edits an image supplied by the caller. The image itself is sent but
    /// only the instruction is recorded as the user turn.
    pub fn refine_image(
        &mut self,
        prior: &ImagePayload,
        instruction: &str,
    ) -> GenerationResult<Exchange> {
        let request = self.client.refine_request(prior, instruction)?;
        let user_turn = Turn::user(Some(instruction.trim().to_string()), Vec::new())?;
        self.run("refine", request, Some(user_turn))
    }

    /// Swaps the client used for later calls. The transcript is kept.
    pub fn set_client(&mut self, client: Arc<GenerationClient>) {
        self.client = client;
    }

    /// Reissues the last request unchanged. Only assistant turns are added.
    pub fn regenerate(&mut self) -> GenerationResult<Exchange> {
        if !self.client.config().features.regenerate {
            return Err(GenerationError::FeatureDisabled("regenerate"));
        }
        let request = self
            .last_request
            .clone()
            .ok_or_else(|| GenerationError::invalid("nothing to regenerate yet"))?;
        self.run("regenerate", request, None)
    }

    pub fn clear(&mut self) {
        let dropped = self.store.len();
        self.store.clear();
        self.last_request = None;
        self.emit(SessionEvent::ConversationCleared {
            dropped_turns: dropped,
        });
    }

    /// Writes the most recent generated image to `path`, or to
    /// `dir/refined_image.<ext>` when `path` is a directory.
    pub fn save_last_image(&self, path: &Path) -> anyhow::Result<PathBuf> {
        let image = self
            .store
            .last_generated_image()
            .ok_or_else(|| anyhow::anyhow!("no generated image to save yet"))?;
        let target = if path.is_dir() {
            path.join(format!(
                "{DEFAULT_DOWNLOAD_NAME}.{}",
                image.format().extension()
            ))
        } else {
            path.to_path_buf()
        };
        image.save(&target)?;
        self.emit(SessionEvent::ImageSaved {
            path: target.to_string_lossy().into_owned(),
            bytes: image.byte_len(),
            mime_type: image.mime_type().to_string(),
        });
        Ok(target)
    }

    /// Plain-text rendering of the transcript, one line per turn.
    pub fn transcript(&self) -> String {
        let mut lines = Vec::with_capacity(self.store.len());
        for (idx, turn) in self.store.turns().iter().enumerate() {
            let mut line = format!("[{idx:03}] {}:", turn.role());
            if let Some(text) = turn.text() {
                line.push(' ');
                line.push_str(text);
            }
            for image in turn.images() {
                line.push_str(&format!(" <{} {} bytes>", image.mime_type(), image.byte_len()));
            }
            lines.push(line);
        }
        lines.join("\n")
    }

    fn run(
        &mut self,
        action: &str,
        request: GenerationRequest,
        user_turn: Option<Turn>,
    ) -> GenerationResult<Exchange> {
        self.emit(SessionEvent::GenerationRequested {
            action: action.to_string(),
            prompt_chars: request.prompt().map(|text| text.chars().count()).unwrap_or(0),
            input_images: request.input_images.len(),
            temperature: request.sampling_temperature,
            turns: self.store.len(),
        });

        let result = self
            .client
            .generate(&request)
            .and_then(|parts| {
                let first_turn = self.store.len();
                self.store.append_exchange(user_turn, parts.clone())?;
                Ok(Exchange { first_turn, parts })
            });

        match &result {
            Ok(exchange) => {
                self.last_request = Some(request);
                self.emit(SessionEvent::GenerationFinished {
                    action: action.to_string(),
                    text_parts: exchange.texts().count(),
                    image_parts: exchange.images().count(),
                    turns: self.store.len(),
                });
            }
            Err(err) => {
                self.emit(SessionEvent::GenerationFailed {
                    action: action.to_string(),
                    error_kind: err.label().to_string(),
                    message: err.to_string(),
                    turns: self.store.len(),
                });
            }
        }
        result
    }

    fn emit(&self, event: SessionEvent) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        let kind = event.kind();
        if let Err(err) = events.append(event) {
            warn!(event = kind, error = %err, "failed to write session event");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use image::ImageFormat as CodecFormat;
    use serde_json::Value;
    use shears_contracts::conversation::{ConversationStore, ImageFormat, ImagePayload, Role, Turn};
    use shears_contracts::errors::GenerationError;
    use shears_contracts::generation::GenerationRequest;

    use super::Session;
    use crate::client::tests::ScriptedTransport;
    use crate::client::GenerationClient;
    use crate::config::ClientConfig;
    use crate::normalize::tests::encoded_image;
    use crate::transport::ContentPart;

    fn session_with(transport: &ScriptedTransport, config: ClientConfig) -> Session {
        let client = GenerationClient::new(config, Box::new(transport.clone()));
        Session::new(Arc::new(client), None)
    }

    fn roles(store: &ConversationStore) -> Vec<Role> {
        store.turns().iter().map(Turn::role).collect()
    }

    fn upload() -> ImagePayload {
        ImagePayload::new(encoded_image(8, 8, CodecFormat::Png), ImageFormat::Png)
    }

    #[test]
    fn submit_appends_user_then_assistant_turns() -> anyhow::Result<()> {
        let transport = ScriptedTransport::with_image(32, 32);
        let mut session = session_with(&transport, ClientConfig::default());
        let exchange = session.submit(GenerationRequest::text("logo").with_image(upload()))?;

        assert_eq!(exchange.first_turn, 0);
        assert_eq!(
            roles(session.store()),
            vec![Role::User, Role::Assistant, Role::Assistant]
        );
        assert_eq!(session.store().turns()[0].images().len(), 1);
        assert_eq!(session.store().last_generated_image(), exchange.images().next());
        Ok(())
    }

    #[test]
    fn transport_failure_leaves_store_unchanged() -> anyhow::Result<()> {
        let ok = ScriptedTransport::with_image(32, 32);
        let mut session = session_with(&ok, ClientConfig::default());
        session.submit(GenerationRequest::text("logo"))?;
        let before = session.store().clone();

        let failing = ScriptedTransport::failing_auth();
        let mut failing_session = Session {
            client: Arc::new(GenerationClient::new(
                ClientConfig::default(),
                Box::new(failing.clone()),
            )),
            ..session
        };
        let err = failing_session
            .submit(GenerationRequest::text("otra"))
            .unwrap_err();
        assert!(matches!(err, GenerationError::Transport(_)));
        assert_eq!(failing_session.store(), &before);
        assert_eq!(failing_session.store().len(), 3);

        let refine_err = failing_session.refine("make it blue").unwrap_err();
        assert!(matches!(refine_err, GenerationError::Transport(_)));
        assert_eq!(failing_session.store(), &before);
        Ok(())
    }

    #[test]
    fn empty_submit_never_reaches_transport() {
        let transport = ScriptedTransport::with_image(32, 32);
        let mut session = session_with(&transport, ClientConfig::default());
        let err = session.submit(GenerationRequest::default()).unwrap_err();
        assert!(matches!(err, GenerationError::InputValidation(_)));
        assert_eq!(transport.sends.load(Ordering::SeqCst), 0);
        assert!(session.store().is_empty());
    }

    #[test]
    fn refine_uses_only_the_latest_generated_image() -> anyhow::Result<()> {
        let transport = ScriptedTransport::with_image(32, 32);
        let mut session = session_with(&transport, ClientConfig::default());
        session.submit(GenerationRequest::text("logo").with_image(upload()))?;
        session.submit(GenerationRequest::text("otra versión"))?;
        session.submit(GenerationRequest::text("con fondo blanco"))?;
        let latest = session
            .store()
            .last_generated_image()
            .cloned()
            .expect("generated image");

        session.refine("make it blue")?;
        let (parts, _) = transport.last_call().expect("refine call");
        let images: Vec<&ContentPart> = parts.iter().filter(|part| part.is_image()).collect();
        assert_eq!(images.len(), 1);
        assert_eq!(
            images[0],
            &ContentPart::InlineData {
                mime_type: latest.mime_type().to_string(),
                data: latest.bytes().to_vec(),
            }
        );
        assert_eq!(parts[0], ContentPart::Text("make it blue".to_string()));

        let last_user = session
            .store()
            .turns()
            .iter()
            .rev()
            .find(|turn| turn.role() == Role::User)
            .expect("user turn");
        assert_eq!(last_user.text(), Some("make it blue"));
        Ok(())
    }

    #[test]
    fn refine_without_a_generated_image_is_rejected() {
        let transport =
            ScriptedTransport::replying(|| Ok(vec![ContentPart::Text("solo texto".to_string())]));
        let mut session = session_with(&transport, ClientConfig::default());
        session.submit(GenerationRequest::text("hola")).unwrap();
        let sends = transport.sends.load(Ordering::SeqCst);

        let err = session.refine("make it blue").unwrap_err();
        assert!(matches!(err, GenerationError::InputValidation(_)));
        assert_eq!(transport.sends.load(Ordering::SeqCst), sends);
    }

    #[test]
    fn disabled_refine_is_reported_before_image_lookup() -> anyhow::Result<()> {
        let transport = ScriptedTransport::with_image(32, 32);
        let mut config = ClientConfig::default();
        config.features.refine = false;
        let mut session = session_with(&transport, config);
        assert!(matches!(
            session.refine("make it blue"),
            Err(GenerationError::FeatureDisabled("refine"))
        ));

        session.submit(GenerationRequest::text("logo"))?;
        let before = session.store().clone();
        assert!(matches!(
            session.refine("make it blue"),
            Err(GenerationError::FeatureDisabled("refine"))
        ));
        assert_eq!(session.store(), &before);
        assert_eq!(transport.sends.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn regenerate_reissues_the_last_request() -> anyhow::Result<()> {
        let transport = ScriptedTransport::with_image(32, 32);
        let mut session = session_with(&transport, ClientConfig::default());
        assert!(matches!(
            session.regenerate(),
            Err(GenerationError::InputValidation(_))
        ));

        let request = GenerationRequest::text("logo").with_temperature(Some(0.3));
        session.submit(request.clone())?;
        let first_call = transport.last_call().expect("first call");
        let exchange = session.regenerate()?;
        assert_eq!(transport.last_call().expect("second call"), first_call);
        assert_eq!(session.last_request(), Some(&request));
        assert_eq!(exchange.first_turn, 3);
        assert_eq!(
            roles(session.store()),
            vec![
                Role::User,
                Role::Assistant,
                Role::Assistant,
                Role::Assistant,
                Role::Assistant
            ]
        );
        Ok(())
    }

    #[test]
    fn regenerate_can_be_disabled() {
        let transport = ScriptedTransport::with_image(32, 32);
        let mut config = ClientConfig::default();
        config.features.regenerate = false;
        let mut session = session_with(&transport, config);
        session.submit(GenerationRequest::text("logo")).unwrap();
        assert!(matches!(
            session.regenerate(),
            Err(GenerationError::FeatureDisabled("regenerate"))
        ));
    }

    #[test]
    fn clear_resets_everything() -> anyhow::Result<()> {
        let transport = ScriptedTransport::with_image(32, 32);
        let mut session = session_with(&transport, ClientConfig::default());
        session.submit(GenerationRequest::text("logo"))?;
        session.clear();
        session.clear();
        assert!(session.store().is_empty());
        assert!(session.store().last_generated_image().is_none());
        assert!(session.last_request().is_none());
        assert!(session.refine("make it blue").is_err());
        Ok(())
    }

    #[test]
    fn sessions_do_not_share_state() -> anyhow::Result<()> {
        let transport = ScriptedTransport::with_image(32, 32);
        let client = Arc::new(GenerationClient::new(
            ClientConfig::default(),
            Box::new(transport.clone()),
        ));
        let mut first = Session::new(Arc::clone(&client), None);
        let second = Session::new(client, None);
        first.submit(GenerationRequest::text("logo"))?;
        assert_eq!(first.store().len(), 3);
        assert!(second.store().is_empty());
        assert_ne!(first.id(), second.id());
        Ok(())
    }

    #[test]
    fn events_and_downloads_are_written() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let transport = ScriptedTransport::with_image(32, 32);
        let client = GenerationClient::new(ClientConfig::default(), Box::new(transport.clone()));
        let mut session = Session::new(Arc::new(client), Some(events_path.clone()));

        assert!(session.save_last_image(temp.path()).is_err());
        session.submit(GenerationRequest::text("logo"))?;
        let saved = session.save_last_image(temp.path())?;
        assert_eq!(saved, temp.path().join("refined_image.png"));
        assert!(saved.exists());

        let failing = GenerationClient::new(
            ClientConfig::default(),
            Box::new(ScriptedTransport::failing_auth()),
        );
        session.client = Arc::new(failing);
        assert!(session.submit(GenerationRequest::text("otra")).is_err());
        session.clear();

        let raw = std::fs::read_to_string(&events_path)?;
        let rows: Vec<Value> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .collect();
        let types: Vec<&str> = rows
            .iter()
            .filter_map(|row| row.get("type").and_then(Value::as_str))
            .collect();
        assert_eq!(
            types,
            vec![
                "session_started",
                "generation_requested",
                "generation_finished",
                "image_saved",
                "generation_requested",
                "generation_failed",
                "conversation_cleared",
            ]
        );
        assert!(rows
            .iter()
            .all(|row| row.get("session_id").and_then(Value::as_str) == Some(session.id())));
        let failed = &rows[5];
        assert_eq!(failed["error_kind"], Value::String("transport".to_string()));
        assert_eq!(failed["turns"], serde_json::json!(3));
        Ok(())
    }

    #[test]
    fn transcript_lists_turns_in_order() -> anyhow::Result<()> {
        let transport = ScriptedTransport::with_image(32, 32);
        let mut session = session_with(&transport, ClientConfig::default());
        session.submit(GenerationRequest::text("logo"))?;
        let transcript = session.transcript();
        let lines: Vec<&str> = transcript.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "[000] user: logo");
        assert_eq!(lines[1], "[001] assistant: Aquí está");
        assert!(lines[2].starts_with("[002] assistant: <image/png "));
        Ok(())
    }
}
