//! # Endpoint
//!
//! Message dispatch: verifies the message's signatures against DID-resolved
//! keys, then routes to the interface/method handler.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::authorization::Authorization;
use crate::provider::Provider;
use crate::{Descriptor, Result};

/// Process a message on the specified tenant's web node.
///
/// # Errors
///
/// Returns an error when the message is malformed, its signatures do not
/// verify, or the handler rejects it. The error's status code and detail
/// make up the reply a transport should return to the caller.
pub async fn handle<T>(
    owner: &str, message: impl Message<Reply = T>, provider: &impl Provider,
) -> Result<Reply<T>> {
    message.validate().await?;
    if let Some(authzn) = message.authorization() {
        authzn.verify(provider).await?;
    }
    message.handle(owner, provider).await
}

/// Methods common to all messages.
#[allow(async_fn_in_trait)]
pub trait Message: Serialize + Clone + Debug + Send + Sync {
    /// The message's inner reply type.
    type Reply;

    /// Compute the CID of the message.
    ///
    /// # Errors
    ///
    /// Returns an error when the message cannot be serialized.
    fn cid(&self) -> Result<String>;

    /// The component of the message descriptor common to all messages.
    fn descriptor(&self) -> &Descriptor;

    /// The message's authorization, when it carries one.
    fn authorization(&self) -> Option<&Authorization>;

    /// Handle the message.
    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>>;

    /// Structural validation common to all messages. Message-specific
    /// validation is done in the message handler.
    async fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Reply used by all endpoints.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Reply<T> {
    /// Status to accompany the reply.
    pub status: Status,

    /// Endpoint-specific reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(flatten)]
    pub body: Option<T>,
}

/// Reply status.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Status code.
    pub code: u16,

    /// Status detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
