use std::sync::Arc;

use tracing::debug;
use yrs::{Doc, GetString, Map, MapRef, Observable, Origin, Out, Subscription, Text, TextRef, Transact};

use crate::error::{BoardError, BoardResult};

/// Transaction origin tag for locally applied edits.
///
/// Observers skip transactions carrying this origin so a local write never
/// feeds back into the edit buffer that produced it.
pub(crate) const LOCAL_EDIT_ORIGIN: &str = "local-edit";

/// A single contiguous edit turning one string into another.
///
/// Offsets and lengths are UTF-8 byte counts aligned to character
/// boundaries, matching the document's offset encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditRegion {
    pub start: u32,
    pub delete_len: u32,
    pub insert: String,
}

/// Compute the single-edit-region diff between `current` and `new`.
///
/// Longest common prefix first, then longest common suffix within the
/// remainder, so prefix + suffix never exceeds the shorter input. Returns
/// `None` when the strings are equal.
///
/// This is a heuristic: it is exact for ordinary single-cursor typing but
/// deliberately collapses disjoint multi-region edits into one larger
/// replacement.
pub fn edit_region(current: &str, new: &str) -> Option<EditRegion> {
    if current == new {
        return None;
    }

    let mut prefix = 0usize;
    for (c, n) in current.chars().zip(new.chars()) {
        if c != n {
            break;
        }
        prefix += c.len_utf8();
    }

    let mut suffix = 0usize;
    for (c, n) in current[prefix..]
        .chars()
        .rev()
        .zip(new[prefix..].chars().rev())
    {
        if c != n {
            break;
        }
        suffix += c.len_utf8();
    }

    Some(EditRegion {
        start: prefix as u32,
        delete_len: (current.len() - prefix - suffix) as u32,
        insert: new[prefix..new.len() - suffix].to_string(),
    })
}

/// Apply `new` to a collaborative text as one delete plus one insert,
/// inside a single locally-tagged transaction.
pub(crate) fn apply_edit(doc: &Doc, text: &TextRef, new: &str) {
    let mut txn = doc.transact_mut_with(LOCAL_EDIT_ORIGIN);
    let current = text.get_string(&txn);
    let Some(region) = edit_region(&current, new) else {
        return;
    };
    if region.delete_len > 0 {
        text.remove_range(&mut txn, region.start, region.delete_len);
    }
    if !region.insert.is_empty() {
        text.insert(&mut txn, region.start, &region.insert);
    }
}

/// Converges a local edit buffer with a card's collaborative text object.
///
/// Local writes go through [`TextBinding::set_text`]; replicated changes
/// from other peers arrive through the `on_remote` callback with the full
/// new content. The binding can be re-pointed at a different text identity
/// with [`TextBinding::rebind`], e.g. after a one-time card migration.
pub struct TextBinding {
    doc: Doc,
    texts: MapRef,
    text_id: String,
    text: TextRef,
    on_remote: Arc<dyn Fn(&str) + Send + Sync>,
    _sub: Subscription,
}

impl TextBinding {
    pub(crate) fn attach(
        doc: Doc,
        texts: MapRef,
        text_id: &str,
        on_remote: Arc<dyn Fn(&str) + Send + Sync>,
    ) -> BoardResult<Self> {
        let text = lookup_text(&doc, &texts, text_id)?;
        let sub = observe_remote(&text, on_remote.clone());
        Ok(Self {
            doc,
            texts,
            text_id: text_id.to_string(),
            text,
            on_remote,
            _sub: sub,
        })
    }

    /// Identity of the text object this binding currently follows.
    pub fn text_id(&self) -> &str {
        &self.text_id
    }

    /// Current content of the bound text object.
    pub fn content(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Converge the text object with the new local buffer content.
    ///
    /// Exactly one delete followed by one insert, atomically; a no-op when
    /// the content is unchanged.
    pub fn set_text(&self, new: &str) {
        apply_edit(&self.doc, &self.text, new);
    }

    /// Follow a new text identity, dropping the previous subscription.
    ///
    /// Emits the new object's content through `on_remote` so the edit
    /// buffer can resynchronize.
    pub fn rebind(&mut self, text_id: &str) -> BoardResult<()> {
        let text = lookup_text(&self.doc, &self.texts, text_id)?;
        debug!(from = %self.text_id, to = %text_id, "rebinding text");
        self._sub = observe_remote(&text, self.on_remote.clone());
        self.text = text;
        self.text_id = text_id.to_string();
        let content = self.content();
        (self.on_remote)(&content);
        Ok(())
    }
}

fn lookup_text(doc: &Doc, texts: &MapRef, text_id: &str) -> BoardResult<TextRef> {
    let txn = doc.transact();
    match texts.get(&txn, text_id) {
        Some(Out::YText(text)) => Ok(text),
        _ => Err(BoardError::TextNotFound {
            id: text_id.to_string(),
        }),
    }
}

fn observe_remote(text: &TextRef, on_remote: Arc<dyn Fn(&str) + Send + Sync>) -> Subscription {
    let observed = text.clone();
    let local: Origin = LOCAL_EDIT_ORIGIN.into();
    text.observe(move |txn, _event| {
        if txn.origin() == Some(&local) {
            return;
        }
        let content = observed.get_string(txn);
        on_remote(&content);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Mutex;
    use yrs::updates::decoder::Decode;
    use yrs::{ReadTxn, StateVector, TextPrelim, Update};

    #[rstest]
    #[case("hello", "helloo", 5, 0, "o")]
    #[case("hello", "helo", 3, 1, "")]
    #[case("hello", "hello world", 5, 0, " world")]
    #[case("hello world", "hello", 5, 6, "")]
    #[case("abc", "abxbc", 2, 0, "xb")]
    #[case("", "seed", 0, 0, "seed")]
    #[case("gone", "", 0, 4, "")]
    #[case("aba", "aa", 1, 1, "")]
    fn diff_produces_single_edit_region(
        #[case] current: &str,
        #[case] new: &str,
        #[case] start: u32,
        #[case] delete_len: u32,
        #[case] insert: &str,
    ) {
        let region = edit_region(current, new).unwrap();
        assert_eq!(region.start, start);
        assert_eq!(region.delete_len, delete_len);
        assert_eq!(region.insert, insert);
    }

    #[test]
    fn diff_is_none_for_equal_strings() {
        assert_eq!(edit_region("same", "same"), None);
        assert_eq!(edit_region("", ""), None);
    }

    #[test]
    fn diff_respects_char_boundaries() {
        let region = edit_region("héllo", "hèllo").unwrap();
        assert_eq!(region.start, 1);
        assert_eq!(region.delete_len, 'é'.len_utf8() as u32);
        assert_eq!(region.insert, "è");
    }

    fn doc_with_text(id: &str, seed: &str) -> (Doc, MapRef) {
        let doc = Doc::new();
        let texts = doc.get_or_insert_map("cardTexts");
        let mut txn = doc.transact_mut();
        texts.insert(&mut txn, id, TextPrelim::new(seed));
        drop(txn);
        (doc, texts)
    }

    fn recorder() -> (Arc<dyn Fn(&str) + Send + Sync>, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: Arc<dyn Fn(&str) + Send + Sync> = Arc::new(move |content: &str| {
            sink.lock().unwrap().push(content.to_string());
        });
        (callback, seen)
    }

    #[test]
    fn local_edits_do_not_echo() {
        let (doc, texts) = doc_with_text("t1", "hello");
        let (callback, seen) = recorder();
        let binding = TextBinding::attach(doc, texts, "t1", callback).unwrap();

        binding.set_text("helloo");
        binding.set_text("helloo there");

        assert_eq!(binding.content(), "helloo there");
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn remote_updates_reach_the_callback() {
        let (doc_a, texts_a) = doc_with_text("t1", "hello");
        let (callback, seen) = recorder();
        let binding = TextBinding::attach(doc_a.clone(), texts_a, "t1", callback).unwrap();

        // A second replica edits the same text and ships its update over.
        let doc_b = Doc::new();
        {
            let update = doc_a
                .transact()
                .encode_state_as_update_v1(&StateVector::default());
            doc_b
                .transact_mut()
                .apply_update(Update::decode_v1(&update).unwrap())
                .unwrap();
        }
        let texts_b = doc_b.get_or_insert_map("cardTexts");
        let text_b = {
            let txn = doc_b.transact();
            match texts_b.get(&txn, "t1") {
                Some(Out::YText(t)) => t,
                other => panic!("expected replicated text, got {:?}", other),
            }
        };
        apply_edit(&doc_b, &text_b, "hello world");
        let update = doc_b
            .transact()
            .encode_state_as_update_v1(&StateVector::default());
        doc_a
            .transact_mut()
            .apply_update(Update::decode_v1(&update).unwrap())
            .unwrap();

        assert_eq!(binding.content(), "hello world");
        let seen = seen.lock().unwrap();
        assert_eq!(seen.last().map(String::as_str), Some("hello world"));
    }

    #[test]
    fn rebind_follows_new_identity() {
        let (doc, texts) = doc_with_text("t1", "first");
        {
            let mut txn = doc.transact_mut();
            texts.insert(&mut txn, "t2", TextPrelim::new("second"));
        }
        let (callback, seen) = recorder();
        let mut binding = TextBinding::attach(doc.clone(), texts, "t1", callback).unwrap();

        binding.rebind("t2").unwrap();
        assert_eq!(binding.text_id(), "t2");
        assert_eq!(binding.content(), "second");
        assert_eq!(seen.lock().unwrap().last().map(String::as_str), Some("second"));

        binding.set_text("second draft");
        assert_eq!(binding.content(), "second draft");

        assert!(binding.rebind("missing").is_err());
    }
}
