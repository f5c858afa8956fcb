//! Exposes an external resource as a stack.

use super::{ExternalResourceController, ResourcePayload, SearchIndexPayload, DEFAULT_VECTOR_DIMENSION};
use crate::config::ParameterSpec;
use crate::core::{InputRef, Stack, StackOutputs};
use crate::provisioner::{ApplyContext, ProvisioningAction, TeardownContext};
use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::json;
use std::fmt;
use std::sync::Arc;

/// Output key every resource stack publishes.
pub const PHYSICAL_ID_OUTPUT: &str = "physical_id";

type PayloadBuilder =
    dyn Fn(&ApplyContext) -> anyhow::Result<Box<dyn ResourcePayload>> + Send + Sync;

/// A provisioning action that drives one external resource.
///
/// Apply brings the resource to `Created` and publishes its physical id as
/// `physical_id`. Teardown deletes it.
pub struct ExternalResourceAction {
    logical_id: String,
    controller: Arc<ExternalResourceController>,
    build: Arc<PayloadBuilder>,
    parent: Option<(String, String)>,
    inputs: Vec<InputRef>,
    parameters: Vec<ParameterSpec>,
}

impl fmt::Debug for ExternalResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalResourceAction")
            .field("logical_id", &self.logical_id)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

impl ExternalResourceAction {
    /// Creates an action whose payload is built from the apply context.
    #[must_use]
    pub fn new<F>(
        logical_id: impl Into<String>,
        controller: Arc<ExternalResourceController>,
        build: F,
    ) -> Self
    where
        F: Fn(&ApplyContext) -> anyhow::Result<Box<dyn ResourcePayload>> + Send + Sync + 'static,
    {
        Self {
            logical_id: logical_id.into(),
            controller,
            build: Arc::new(build),
            parent: None,
            inputs: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// A vector search index.
    ///
    /// The endpoint comes from `endpoint`, an upstream output. The index name
    /// and dimensionality come from the `index_name` and `vector_dimension`
    /// options.
    #[must_use]
    pub fn search_index(
        logical_id: impl Into<String>,
        controller: Arc<ExternalResourceController>,
        endpoint: InputRef,
    ) -> Self {
        let source = endpoint.clone();
        Self::new(logical_id, controller, move |ctx| {
            let endpoint = ctx.inputs.require_str(&source.from_stack, &source.output_key)?;
            let index_name = ctx.parameters.require_str("index_name")?;
            let dimension = ctx
                .parameters
                .get_u64("vector_dimension")
                .map_or(Ok(DEFAULT_VECTOR_DIMENSION), u32::try_from)
                .context("vector_dimension does not fit in 32 bits")?;
            Ok(Box::new(
                SearchIndexPayload::new(endpoint, index_name).with_vector_dimension(dimension),
            ))
        })
        .with_input(endpoint)
        .with_parameter(ParameterSpec::required("index_name").with_description("Index to create"))
        .with_parameter(
            ParameterSpec::optional("vector_dimension")
                .with_default(json!(DEFAULT_VECTOR_DIMENSION))
                .with_description("Embedding dimensionality"),
        )
    }

    /// Makes this resource depend on another resource stack.
    ///
    /// Adds an input on the parent's `physical_id` and refuses creation until
    /// the parent resource is `Created`.
    #[must_use]
    pub fn with_parent(mut self, stack_id: impl Into<String>, logical_id: impl Into<String>) -> Self {
        self.parent = Some((stack_id.into(), logical_id.into()));
        self
    }

    /// Adds an upstream input the payload builder reads.
    #[must_use]
    pub fn with_input(mut self, input: InputRef) -> Self {
        self.inputs.push(input);
        self
    }

    /// Adds an option the payload builder reads.
    #[must_use]
    pub fn with_parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// The logical resource id.
    #[must_use]
    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    /// Wraps the action into a stack declaring `physical_id` and its inputs.
    #[must_use]
    pub fn into_stack(self, stack_id: impl Into<String>) -> Stack {
        let inputs = self.inputs.clone();
        let parameters = self.parameters.clone();
        let parent_input = self
            .parent
            .as_ref()
            .map(|(stack, _)| InputRef::new(stack, PHYSICAL_ID_OUTPUT));

        let mut stack = Stack::new(stack_id, Arc::new(self)).with_output(PHYSICAL_ID_OUTPUT);
        for input in inputs.into_iter().chain(parent_input) {
            stack = stack.with_input(input);
        }
        for parameter in parameters {
            stack = stack.with_parameter(parameter);
        }
        stack
    }
}

#[async_trait]
impl ProvisioningAction for ExternalResourceAction {
    async fn apply(&self, ctx: &ApplyContext) -> anyhow::Result<StackOutputs> {
        let payload = (self.build)(ctx)
            .with_context(|| format!("building payload for resource '{}'", self.logical_id))?;
        let depends_on = self.parent.as_ref().map(|(_, logical_id)| logical_id.as_str());

        let resource = self
            .controller
            .apply(&self.logical_id, payload.as_ref(), depends_on)
            .await?;
        let physical_id = resource
            .physical_id()
            .with_context(|| format!("resource '{}' has no physical id", self.logical_id))?;

        Ok(StackOutputs::from([(
            PHYSICAL_ID_OUTPUT.to_string(),
            json!(physical_id),
        )]))
    }

    async fn teardown(&self, _ctx: &TeardownContext) -> anyhow::Result<()> {
        self.controller.delete(&self.logical_id).await?;
        Ok(())
    }
}
