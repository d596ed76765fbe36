//! Document Dispatch
//!
//! Consumers implement [`DocumentHandler`]; [`dispatch`] calls the handler
//! matching a document's tag. Every handler defaults to a no-op, so consumers
//! only override what they care about and unhandled tags never raise.
//!
//! # Page / Singleton Duality
//!
//! Events and datums arrive either one at a time or as columnar pages. A
//! handler states which form it wants through [`DocumentHandler::event_granularity`]
//! and [`DocumentHandler::datum_granularity`]; `dispatch` converts the other
//! form in index order.

use thiserror::Error;

use crate::document::{
    Datum, DatumPage, Document, DocumentName, Event, EventDescriptor, EventPage, Resource,
    RunStart, RunStop,
};

/// Which form of a paged document a handler wants
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Granularity {
    /// Columnar pages; singletons are wrapped into pages of height 1
    #[default]
    Page,
    /// Single items; pages are split in index order
    Item,
}

/// Failure raised by a consumer while handling a document
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{consumer} failed on {document}: {message}")]
pub struct HandlerError {
    /// Consumer that raised
    pub consumer: String,
    /// Document being handled
    pub document: DocumentName,
    /// What went wrong
    pub message: String,
}

impl HandlerError {
    /// Create a handler error
    pub fn new(
        consumer: impl Into<String>,
        document: DocumentName,
        message: impl Into<String>,
    ) -> Self {
        Self {
            consumer: consumer.into(),
            document,
            message: message.into(),
        }
    }
}

/// Result type returned by every handler
pub type HandlerResult = Result<(), HandlerError>;

/// A stateful consumer of run documents
pub trait DocumentHandler: Send {
    /// Name used in logs and errors
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Form in which event documents are delivered
    fn event_granularity(&self) -> Granularity {
        Granularity::Page
    }

    /// Form in which datum documents are delivered
    fn datum_granularity(&self) -> Granularity {
        Granularity::Page
    }

    /// Run opened
    fn start(&mut self, _doc: &RunStart) -> HandlerResult {
        Ok(())
    }

    /// New event stream
    fn descriptor(&mut self, _doc: &EventDescriptor) -> HandlerResult {
        Ok(())
    }

    /// Single event (only called for [`Granularity::Item`])
    fn event(&mut self, _doc: &Event) -> HandlerResult {
        Ok(())
    }

    /// Page of events (only called for [`Granularity::Page`])
    fn event_page(&mut self, _doc: &EventPage) -> HandlerResult {
        Ok(())
    }

    /// External payload reference
    fn resource(&mut self, _doc: &Resource) -> HandlerResult {
        Ok(())
    }

    /// Single datum (only called for [`Granularity::Item`])
    fn datum(&mut self, _doc: &Datum) -> HandlerResult {
        Ok(())
    }

    /// Page of datums (only called for [`Granularity::Page`])
    fn datum_page(&mut self, _doc: &DatumPage) -> HandlerResult {
        Ok(())
    }

    /// Run closed
    fn stop(&mut self, _doc: &RunStop) -> HandlerResult {
        Ok(())
    }
}

/// Invoke the handler matching `document` on `handler`
///
/// When a page is split into items, the first failing item stops the split
/// and its error is returned.
pub fn dispatch<H: DocumentHandler + ?Sized>(
    handler: &mut H,
    document: &Document,
) -> HandlerResult {
    match document {
        Document::Start(doc) => handler.start(doc),
        Document::Descriptor(doc) => handler.descriptor(doc),
        Document::Resource(doc) => handler.resource(doc),
        Document::Stop(doc) => handler.stop(doc),
        Document::Event(doc) => match handler.event_granularity() {
            Granularity::Item => handler.event(doc),
            Granularity::Page => handler.event_page(&EventPage::from_event(doc)),
        },
        Document::EventPage(page) => match handler.event_granularity() {
            Granularity::Page => handler.event_page(page),
            Granularity::Item => page.events().iter().try_for_each(|e| handler.event(e)),
        },
        Document::Datum(doc) => match handler.datum_granularity() {
            Granularity::Item => handler.datum(doc),
            Granularity::Page => handler.datum_page(&DatumPage::from_datum(doc)),
        },
        Document::DatumPage(page) => match handler.datum_granularity() {
            Granularity::Page => handler.datum_page(page),
            Granularity::Item => page.datums().iter().try_for_each(|d| handler.datum(d)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::RunUid;
    use serde_json::json;

    #[derive(Default)]
    struct Tally {
        granularity: Granularity,
        calls: Vec<String>,
        fail_on_seq: Option<u64>,
    }

    impl DocumentHandler for Tally {
        fn name(&self) -> &str {
            "tally"
        }

        fn event_granularity(&self) -> Granularity {
            self.granularity
        }

        fn datum_granularity(&self) -> Granularity {
            self.granularity
        }

        fn start(&mut self, doc: &RunStart) -> HandlerResult {
            self.calls.push(format!("start:{}", doc.uid));
            Ok(())
        }

        fn event(&mut self, doc: &Event) -> HandlerResult {
            if self.fail_on_seq == Some(doc.seq_num) {
                return Err(HandlerError::new("tally", DocumentName::Event, "boom"));
            }
            self.calls.push(format!("event:{}", doc.seq_num));
            Ok(())
        }

        fn event_page(&mut self, doc: &EventPage) -> HandlerResult {
            self.calls.push(format!("page:{:?}", doc.seq_num));
            Ok(())
        }

        fn datum(&mut self, doc: &Datum) -> HandlerResult {
            self.calls.push(format!("datum:{}", doc.datum_id));
            Ok(())
        }

        fn datum_page(&mut self, doc: &DatumPage) -> HandlerResult {
            self.calls.push(format!("datum_page:{}", doc.height()));
            Ok(())
        }
    }

    fn page() -> EventPage {
        EventPage::from_columns("d1", 1, [("x", vec![json!(1), json!(2), json!(3)])])
    }

    #[test]
    fn test_default_handlers_are_noops() {
        struct Silent;
        impl DocumentHandler for Silent {}

        let mut silent = Silent;
        let run = RunUid::new("r");
        assert!(dispatch(&mut silent, &Document::Start(RunStart::new(run.clone()))).is_ok());
        assert!(dispatch(&mut silent, &Document::EventPage(page())).is_ok());
        assert!(dispatch(&mut silent, &Document::Stop(RunStop::new(&run))).is_ok());
    }

    #[test]
    fn test_page_split_for_item_handler() {
        let mut tally = Tally {
            granularity: Granularity::Item,
            ..Tally::default()
        };
        dispatch(&mut tally, &Document::EventPage(page())).unwrap();
        assert_eq!(tally.calls, vec!["event:1", "event:2", "event:3"]);
    }

    #[test]
    fn test_event_wrapped_for_page_handler() {
        let mut tally = Tally::default();
        let event = page().events().remove(1);
        dispatch(&mut tally, &Document::Event(event)).unwrap();
        assert_eq!(tally.calls, vec!["page:[2]"]);
    }

    #[test]
    fn test_split_stops_at_first_failure() {
        let mut tally = Tally {
            granularity: Granularity::Item,
            fail_on_seq: Some(2),
            ..Tally::default()
        };
        let err = dispatch(&mut tally, &Document::EventPage(page())).unwrap_err();
        assert_eq!(err.message, "boom");
        assert_eq!(tally.calls, vec!["event:1"]);
    }

    #[test]
    fn test_datum_duality() {
        let datum = Datum {
            resource: "res".to_string(),
            datum_id: "res/0".to_string(),
            datum_kwargs: serde_json::Map::new(),
        };

        let mut paged = Tally::default();
        dispatch(&mut paged, &Document::Datum(datum.clone())).unwrap();
        assert_eq!(paged.calls, vec!["datum_page:1"]);

        let mut items = Tally {
            granularity: Granularity::Item,
            ..Tally::default()
        };
        dispatch(&mut items, &Document::DatumPage(DatumPage::from_datum(&datum))).unwrap();
        assert_eq!(items.calls, vec!["datum:res/0"]);
    }
}
