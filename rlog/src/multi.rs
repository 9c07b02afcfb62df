//! Fan-out over several loggers or collectors.
//!
//! Composites are always flat: nesting a composite contributes its members,
//! never the composite itself. Every operation reaches every member and the
//! failures are combined into one error.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::config::Scope;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::logger::Logger;
use crate::remote::AddressSink;

fn flatten<T: ?Sized>(
    items: impl IntoIterator<Item = Option<Arc<T>>>,
    members: impl Fn(&T) -> Option<Vec<Arc<T>>>,
) -> Vec<Arc<T>> {
    let mut flat = Vec::new();
    for item in items.into_iter().flatten() {
        match members(&*item) {
            Some(inner) => flat.extend(inner),
            None => flat.push(item),
        }
    }
    flat
}

fn combined<T>(results: Vec<Result<T>>) -> Result<()> {
    let errors: Vec<Error> = results.into_iter().filter_map(|r| r.err()).collect();
    match Error::combine(errors) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Fan-out over several loggers.
pub struct MultiLogger {
    members: Vec<Arc<dyn Logger>>,
    scope: Scope,
}

/// Combine loggers into one.
///
/// `None` entries are skipped and composites are flattened. Returns `None`
/// when nothing is left and the logger itself when exactly one is.
pub fn multi_logger(
    loggers: impl IntoIterator<Item = Option<Arc<dyn Logger>>>,
) -> Option<Arc<dyn Logger>> {
    let mut members = flatten(loggers, |logger| logger.members());
    match members.len() {
        0 => None,
        1 => members.pop(),
        _ => {
            let scope = members[0].scope().clone();
            Some(Arc::new(MultiLogger { members, scope }))
        }
    }
}

#[async_trait]
impl Logger for MultiLogger {
    async fn output(&self, event: Event) -> Result<()> {
        combined(join_all(self.members.iter().map(|m| m.output(event.clone()))).await)
    }

    /// Every member gets the full buffer; reports its length when all
    /// succeed.
    async fn write(&self, buf: &[u8]) -> Result<usize> {
        combined(join_all(self.members.iter().map(|m| m.write(buf))).await)?;
        Ok(buf.len())
    }

    async fn set_outs(&self, outs: &[&dyn AddressSink]) -> Result<()> {
        combined(join_all(self.members.iter().map(|m| m.set_outs(outs))).await)
    }

    async fn add_outs(&self, outs: &[&dyn AddressSink]) -> Result<()> {
        combined(join_all(self.members.iter().map(|m| m.add_outs(outs))).await)
    }

    async fn close(&self) -> Result<()> {
        combined(join_all(self.members.iter().map(|m| m.close())).await)
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn members(&self) -> Option<Vec<Arc<dyn Logger>>> {
        Some(self.members.clone())
    }
}

/// A server that accepts events until stopped.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn serve(&self) -> Result<()>;

    fn stop(&self);

    fn members(&self) -> Option<Vec<Arc<dyn Collector>>> {
        None
    }
}

/// Fan-out over several collectors.
pub struct MultiCollector {
    members: Vec<Arc<dyn Collector>>,
}

/// Combine collectors into one, with the same flattening rules as
/// [`multi_logger`].
pub fn multi_collector(
    collectors: impl IntoIterator<Item = Option<Arc<dyn Collector>>>,
) -> Option<Arc<dyn Collector>> {
    let mut members = flatten(collectors, |collector| collector.members());
    match members.len() {
        0 => None,
        1 => members.pop(),
        _ => Some(Arc::new(MultiCollector { members })),
    }
}

#[async_trait]
impl Collector for MultiCollector {
    /// Serve every member concurrently until all of them return.
    async fn serve(&self) -> Result<()> {
        combined(join_all(self.members.iter().map(|m| m.serve())).await)
    }

    fn stop(&self) {
        for member in &self.members {
            member.stop();
        }
    }

    fn members(&self) -> Option<Vec<Arc<dyn Collector>>> {
        Some(self.members.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        outputs: AtomicUsize,
        bytes: AtomicUsize,
        closed: AtomicBool,
        broken: bool,
        scope: Scope,
    }

    impl Counting {
        fn broken() -> Self {
            Self {
                broken: true,
                ..Self::default()
            }
        }

        fn fail(&self) -> Result<()> {
            if self.broken {
                Err(Error::Closed)
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Logger for Counting {
        async fn output(&self, _event: Event) -> Result<()> {
            self.outputs.fetch_add(1, Ordering::SeqCst);
            self.fail()
        }

        async fn write(&self, buf: &[u8]) -> Result<usize> {
            self.bytes.fetch_add(buf.len(), Ordering::SeqCst);
            self.fail()?;
            Ok(buf.len())
        }

        async fn set_outs(&self, _outs: &[&dyn AddressSink]) -> Result<()> {
            self.fail()
        }

        async fn add_outs(&self, _outs: &[&dyn AddressSink]) -> Result<()> {
            self.fail()
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            self.fail()
        }

        fn scope(&self) -> &Scope {
            &self.scope
        }
    }

    fn logger(counting: &Arc<Counting>) -> Option<Arc<dyn Logger>> {
        Some(counting.clone() as Arc<dyn Logger>)
    }

    #[test]
    fn empty_and_none_only_yield_none() {
        assert!(multi_logger([]).is_none());
        assert!(multi_logger([None, None]).is_none());
    }

    #[test]
    fn single_member_is_returned_as_is() {
        let only = Arc::new(Counting::default());
        let combined = multi_logger([None, logger(&only), None]).unwrap();
        let only: Arc<dyn Logger> = only;
        assert!(Arc::ptr_eq(&combined, &only));
    }

    #[test]
    fn nested_composites_are_flattened() {
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        let c = Arc::new(Counting::default());

        let inner = multi_logger([logger(&b), logger(&c)]);
        let nested = multi_logger([logger(&a), inner, None]).unwrap();
        let direct = multi_logger([logger(&a), logger(&b), logger(&c)]).unwrap();

        let nested = nested.members().unwrap();
        let direct = direct.members().unwrap();
        assert_eq!(nested.len(), 3);
        for (n, d) in nested.iter().zip(&direct) {
            assert!(Arc::ptr_eq(n, d));
        }
    }

    #[tokio::test]
    async fn every_member_is_reached_and_errors_combined() {
        let good = Arc::new(Counting::default());
        let bad = Arc::new(Counting::broken());
        let worse = Arc::new(Counting::broken());
        let combined = multi_logger([logger(&bad), logger(&good), logger(&worse)]).unwrap();

        let err = combined.write(b"hello").await.unwrap_err();
        assert!(matches!(err, Error::Multi(ref v) if v.len() == 2));
        assert_eq!(good.bytes.load(Ordering::SeqCst), 5);
        assert_eq!(bad.bytes.load(Ordering::SeqCst), 5);

        combined.output(Event::builder().build()).await.unwrap_err();
        assert_eq!(good.outputs.load(Ordering::SeqCst), 1);

        combined.close().await.unwrap_err();
        assert!(good.closed.load(Ordering::SeqCst));
        assert!(worse.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn write_reports_full_length_on_success() {
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        let combined = multi_logger([logger(&a), logger(&b)]).unwrap();

        assert_eq!(combined.write(b"abc").await.unwrap(), 3);
    }

    struct Stoppable {
        stopped: AtomicBool,
    }

    #[async_trait]
    impl Collector for Stoppable {
        async fn serve(&self) -> Result<()> {
            Ok(())
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn collectors_stop_together() {
        let a = Arc::new(Stoppable {
            stopped: AtomicBool::new(false),
        });
        let b = Arc::new(Stoppable {
            stopped: AtomicBool::new(false),
        });
        let combined = multi_collector([
            Some(a.clone() as Arc<dyn Collector>),
            None,
            Some(b.clone() as Arc<dyn Collector>),
        ])
        .unwrap();

        combined.serve().await.unwrap();
        combined.stop();
        assert!(a.stopped.load(Ordering::SeqCst));
        assert!(b.stopped.load(Ordering::SeqCst));
    }
}
