// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ordered execution of a route's filters around the dispatcher.

use std::fmt;
use std::sync::Arc;

use super::FilterRegistry;
use crate::core::{Dispatch, Exchange, Filter, FilterAction, ProxyError};
use crate::router::FilterConfig;
use crate::{debug_fmt, trace_fmt, warn_fmt};

/// The compiled, ordered filter list of one route.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.filters.iter().map(|filter| filter.name()))
            .finish()
    }
}

impl FilterChain {
    /// Instantiate `global` then `route` filters, stably sorted on `order`.
    pub fn build(
        route: &[FilterConfig],
        global: &[FilterConfig],
        registry: &FilterRegistry,
    ) -> Result<Self, ProxyError> {
        let mut specs: Vec<&FilterConfig> = global.iter().chain(route.iter()).collect();
        specs.sort_by_key(|spec| spec.order);

        let filters = specs
            .into_iter()
            .map(|spec| registry.create(spec))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { filters })
    }

    pub fn from_filters(filters: Vec<Arc<dyn Filter>>) -> Self {
        Self { filters }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Filter names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Run pre-filters, the dispatcher, then post-filters in reverse.
    ///
    /// On return `exchange.response` holds the response draft unless an
    /// error is returned.
    pub async fn execute(
        &self,
        exchange: &mut Exchange,
        dispatcher: &dyn Dispatch,
    ) -> Result<(), ProxyError> {
        let mut passed = 0;

        for filter in &self.filters {
            if !filter.filter_type().is_pre() {
                passed += 1;
                continue;
            }

            trace_fmt!("FilterChain", "[{}] pre {}", exchange.id, filter.name());
            match filter.pre_filter(exchange).await {
                Ok(FilterAction::Continue) => passed += 1,
                Ok(FilterAction::Respond(response)) => {
                    debug_fmt!(
                        "FilterChain",
                        "[{}] {} answered {} without dispatch",
                        exchange.id,
                        filter.name(),
                        response.status
                    );
                    exchange.response = Some(response);
                    break;
                }
                Err(err) => {
                    exchange.failure = Some("filter");
                    let err = match err {
                        ProxyError::Filter(_) => err,
                        other => ProxyError::Filter(format!("{}: {}", filter.name(), other)),
                    };
                    return Err(err);
                }
            }
        }

        let mut dispatch_error = None;
        if exchange.response.is_none() {
            if let Err(err) = dispatcher.dispatch(exchange).await {
                exchange.failure = Some(err.kind.as_str());
                dispatch_error = Some(err);
            }
        }

        for filter in self.filters[..passed].iter().rev() {
            if !filter.filter_type().is_post() {
                continue;
            }
            trace_fmt!("FilterChain", "[{}] post {}", exchange.id, filter.name());
            if let Err(err) = filter.post_filter(exchange).await {
                warn_fmt!(
                    "FilterChain",
                    "[{}] post filter {} failed: {}",
                    exchange.id,
                    filter.name(),
                    err
                );
            }
        }

        match dispatch_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}
