//! Interceptors observing and rewriting the parts of a call.
//!
//! An [`InterceptorPipeline`] sits between the transport and the call
//! machinery, on both the client and the server side. Request parts are
//! passed through the interceptors in the order they were added, response
//! parts in reverse order.
//!
//! An interceptor rejects a part by returning a [`Status`]: a rejected
//! inbound part cancels the call with that status, a rejected outbound part
//! replaces the outcome of the call with it.

use std::{fmt, sync::Arc};

use bytes::Bytes;

use crate::{
    Status,
    parts::{RequestPart, ResponsePart},
};

/// Middleware with access to the serialized parts of a call.
pub trait Interceptor: Send + Sync + 'static {
    /// Inspect or modify a request part.
    fn intercept_request(&self, _part: &mut RequestPart<Bytes>) -> Result<(), Status> {
        Ok(())
    }

    /// Inspect or modify a response part.
    fn intercept_response(&self, _part: &mut ResponsePart<Bytes>) -> Result<(), Status> {
        Ok(())
    }
}

impl<I: Interceptor> Interceptor for Arc<I> {
    fn intercept_request(&self, part: &mut RequestPart<Bytes>) -> Result<(), Status> {
        (**self).intercept_request(part)
    }

    fn intercept_response(&self, part: &mut ResponsePart<Bytes>) -> Result<(), Status> {
        (**self).intercept_response(part)
    }
}

/// An ordered chain of [`Interceptor`]s.
#[derive(Clone, Default)]
pub struct InterceptorPipeline {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorPipeline {
    /// Create a new empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor to the pipeline.
    #[must_use]
    pub fn with_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Append an interceptor to the pipeline.
    pub fn push_interceptor(&mut self, interceptor: impl Interceptor) -> &mut Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Returns true if there are no interceptors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Returns the number of interceptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }
}

impl Interceptor for InterceptorPipeline {
    fn intercept_request(&self, part: &mut RequestPart<Bytes>) -> Result<(), Status> {
        for interceptor in &self.interceptors {
            interceptor.intercept_request(part)?;
        }
        Ok(())
    }

    fn intercept_response(&self, part: &mut ResponsePart<Bytes>) -> Result<(), Status> {
        for interceptor in self.interceptors.iter().rev() {
            interceptor.intercept_response(part)?;
        }
        Ok(())
    }
}

impl fmt::Debug for InterceptorPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorPipeline")
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

/// An [`Interceptor`] created from a function over request parts.
///
/// Created using [`request_fn`].
#[derive(Clone)]
pub struct RequestFn<F> {
    f: F,
}

/// Create an [`Interceptor`] from a function over request parts.
pub fn request_fn<F>(f: F) -> RequestFn<F>
where
    F: Fn(&mut RequestPart<Bytes>) -> Result<(), Status> + Send + Sync + 'static,
{
    RequestFn { f }
}

impl<F> Interceptor for RequestFn<F>
where
    F: Fn(&mut RequestPart<Bytes>) -> Result<(), Status> + Send + Sync + 'static,
{
    fn intercept_request(&self, part: &mut RequestPart<Bytes>) -> Result<(), Status> {
        (self.f)(part)
    }
}

impl<F> fmt::Debug for RequestFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestFn").finish_non_exhaustive()
    }
}

/// An [`Interceptor`] created from a function over response parts.
///
/// Created using [`response_fn`].
#[derive(Clone)]
pub struct ResponseFn<F> {
    f: F,
}

/// Create an [`Interceptor`] from a function over response parts.
pub fn response_fn<F>(f: F) -> ResponseFn<F>
where
    F: Fn(&mut ResponsePart<Bytes>) -> Result<(), Status> + Send + Sync + 'static,
{
    ResponseFn { f }
}

impl<F> Interceptor for ResponseFn<F>
where
    F: Fn(&mut ResponsePart<Bytes>) -> Result<(), Status> + Send + Sync + 'static,
{
    fn intercept_response(&self, part: &mut ResponsePart<Bytes>) -> Result<(), Status> {
        (self.f)(part)
    }
}

impl<F> fmt::Debug for ResponseFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFn").finish_non_exhaustive()
    }
}
