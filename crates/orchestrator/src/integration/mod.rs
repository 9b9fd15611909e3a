mod invoker;
mod provider;

pub use invoker::{IntegrationInvoker, IntegrationJob, IntegrationOutcome, InvokerSettings};
pub use provider::{
    HttpIntegrationProvider, IntegrationError, IntegrationRequest, IntegrationProvider,
    ProviderRegistry, SendResponse,
};
