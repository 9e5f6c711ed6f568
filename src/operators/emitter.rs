use std::sync::Arc;
use std::sync::RwLock;

use super::Event;
use super::OperatorChain;
use crate::dag::Direction;
use crate::dag::SinkVertex;
use crate::read_lock;
use crate::write_lock;

#[derive(Clone)]
pub enum RouteTarget {
    Chain(Arc<OperatorChain>),
    Sink(Arc<SinkVertex>),
}

/// One outgoing edge as seen by the dispatch path.
#[derive(Clone)]
pub struct Route {
    pub direction: Direction,
    pub target: RouteTarget,
}

/// Fan-out of a vertex.
///
/// The route list is replaced wholesale when a merge changes the
/// vertex's children, so emitting only holds the lock long enough to
/// clone an [`Arc`].
pub struct OutputEmitter {
    routes: RwLock<Arc<[Route]>>,
}

impl Default for OutputEmitter {
    fn default() -> Self {
        Self {
            routes: RwLock::new(Arc::from(Vec::new())),
        }
    }
}

impl OutputEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: Event) {
        let routes = read_lock!(self.routes).clone();
        if let Some((last, rest)) = routes.split_last() {
            for route in rest {
                route.deliver(event.clone());
            }
            last.deliver(event);
        }
    }

    pub fn set_routes(&self, routes: Vec<Route>) {
        *write_lock!(self.routes) = Arc::from(routes);
    }

    pub fn route_count(&self) -> usize {
        read_lock!(self.routes).len()
    }
}

impl Route {
    fn deliver(&self, event: Event) {
        match &self.target {
            RouteTarget::Chain(chain) => chain.push(self.direction, event),
            RouteTarget::Sink(sink) => sink.write(&event),
        }
    }
}
