use crate::conversation::{ImagePayload, Role, Turn};
use crate::errors::GenerationResult;
use crate::generation::GenerationResponsePart;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ImageRef {
    turn: usize,
    image: usize,
}

/// Ordered transcript for one session.
///
/// Append-only apart from [`ConversationStore::clear`]. The most recent
/// assistant image is tracked as turns are appended so refine never has to
/// scan the transcript.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationStore {
    turns: Vec<Turn>,
    last_image: Option<ImageRef>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, turn: Turn) -> usize {
        let index = self.turns.len();
        if turn.role() == Role::Assistant && !turn.images().is_empty() {
            self.last_image = Some(ImageRef {
                turn: index,
                image: turn.images().len() - 1,
            });
        }
        self.turns.push(turn);
        index
    }

    /// Appends an optional user turn followed by one assistant turn per part.
    ///
    /// Every turn is built before anything is appended, so a part that cannot
    /// become a turn leaves the store untouched.
    pub fn append_exchange(
        &mut self,
        user_turn: Option<Turn>,
        parts: Vec<GenerationResponsePart>,
    ) -> GenerationResult<usize> {
        let assistant_turns = parts
            .into_iter()
            .map(GenerationResponsePart::into_turn)
            .collect::<GenerationResult<Vec<Turn>>>()?;
        let mut appended = 0;
        for turn in user_turn.into_iter().chain(assistant_turns) {
            self.append(turn);
            appended += 1;
        }
        Ok(appended)
    }

    pub fn clear(&mut self) {
        self.turns.clear();
        self.last_image = None;
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last_generated_image(&self) -> Option<&ImagePayload> {
        let ImageRef { turn, image } = self.last_image?;
        self.turns.get(turn)?.images().get(image)
    }
}

#[cfg(test)]
mod tests {
    use super::ConversationStore;
    use crate::conversation::{ImageFormat, ImagePayload, Role, Turn};
    use crate::generation::GenerationResponsePart;

    fn image(tag: &str) -> ImagePayload {
        ImagePayload::new(tag.as_bytes().to_vec(), ImageFormat::Png)
    }

    #[test]
    fn append_preserves_order() {
        let mut store = ConversationStore::new();
        store.append(Turn::user(Some("logo".to_string()), Vec::new()).unwrap());
        store.append(Turn::assistant_text("aca va").unwrap());

        let roles: Vec<Role> = store.turns().iter().map(Turn::role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(store.turns()[0].text(), Some("logo"));
        assert_eq!(store.turns()[1].text(), Some("aca va"));
    }

    #[test]
    fn clear_is_idempotent_and_matches_fresh_store() {
        let mut store = ConversationStore::new();
        store.append(Turn::user(Some("logo".to_string()), Vec::new()).unwrap());
        store.append(Turn::assistant_image(image("a")));
        assert!(store.last_generated_image().is_some());

        store.clear();
        assert_eq!(store, ConversationStore::new());
        store.clear();
        assert_eq!(store, ConversationStore::new());
        assert!(store.is_empty());
        assert!(store.last_generated_image().is_none());
    }

    #[test]
    fn last_generated_image_tracks_latest_assistant_image() {
        let mut store = ConversationStore::new();
        assert!(store.last_generated_image().is_none());

        store.append(Turn::user(Some("first".to_string()), vec![image("upload-1")]).unwrap());
        assert!(store.last_generated_image().is_none());

        store.append(Turn::assistant_image(image("gen-1")));
        store.append(Turn::assistant_text("here you go").unwrap());
        assert_eq!(store.last_generated_image(), Some(&image("gen-1")));

        store.append(Turn::user(None, vec![image("upload-2")]).unwrap());
        assert_eq!(store.last_generated_image(), Some(&image("gen-1")));

        store.append(Turn::assistant_image(image("gen-2")));
        store.append(Turn::assistant_text("and a caption").unwrap());
        store.append(Turn::assistant_image(image("gen-3")));
        assert_eq!(store.last_generated_image(), Some(&image("gen-3")));
    }

    #[test]
    fn last_generated_image_after_clear_append_cycle() {
        let mut store = ConversationStore::new();
        store.append(Turn::assistant_image(image("old")));
        store.clear();
        store.append(Turn::assistant_text("no image yet").unwrap());
        assert!(store.last_generated_image().is_none());
        store.append(Turn::assistant_image(image("new")));
        assert_eq!(store.last_generated_image(), Some(&image("new")));
    }

    #[test]
    fn append_exchange_is_all_or_nothing() {
        let mut store = ConversationStore::new();
        let user = Turn::user(Some("logo".to_string()), Vec::new()).unwrap();
        let appended = store
            .append_exchange(
                Some(user.clone()),
                vec![
                    GenerationResponsePart::Text("listo".to_string()),
                    GenerationResponsePart::Image(image("gen")),
                ],
            )
            .unwrap();
        assert_eq!(appended, 3);
        assert_eq!(store.last_generated_image(), Some(&image("gen")));

        let before = store.clone();
        let err = store.append_exchange(
            Some(user),
            vec![
                GenerationResponsePart::Image(image("other")),
                GenerationResponsePart::Text(String::new()),
            ],
        );
        assert!(err.is_err());
        assert_eq!(store, before);
    }
}
