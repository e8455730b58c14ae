//! Client stub for the well-known authentication service

use crate::error::ClientError;
use crate::service::{MethodDescriptor, RemoteService, ServiceClient};
use hopwire_proto::auth::{
    AUTHENTICATE_AGAIN, AUTH_SERVICE, LOGOFF, LOGON, LOGON_FAULT, PING,
};
use hopwire_proto::{LogonResult, Properties, Value, COMPONENT_FAULT};

static LOGON_METHOD: MethodDescriptor =
    MethodDescriptor::new(AUTH_SERVICE, LOGON, &[LOGON_FAULT, COMPONENT_FAULT]);
static AUTHENTICATE_AGAIN_METHOD: MethodDescriptor =
    MethodDescriptor::new(AUTH_SERVICE, AUTHENTICATE_AGAIN, &[LOGON_FAULT, COMPONENT_FAULT]);
static PING_METHOD: MethodDescriptor = MethodDescriptor::new(AUTH_SERVICE, PING, &[]);
static LOGOFF_METHOD: MethodDescriptor =
    MethodDescriptor::new(AUTH_SERVICE, LOGOFF, &[COMPONENT_FAULT]);

/// Typed stub for `AuthService`
#[derive(Debug, Clone)]
pub struct AuthService {
    client: ServiceClient,
}

impl RemoteService for AuthService {
    const INTERFACE: &'static str = AUTH_SERVICE;

    fn bind(client: ServiceClient) -> Self {
        Self { client }
    }
}

impl AuthService {
    pub async fn logon(&self, properties: &Properties) -> Result<LogonResult, ClientError> {
        self.client
            .call_decode(&LOGON_METHOD, vec![Value::object(properties)?])
            .await
    }

    pub async fn authenticate_again(
        &self,
        properties: &Properties,
    ) -> Result<LogonResult, ClientError> {
        self.client
            .call_decode(&AUTHENTICATE_AGAIN_METHOD, vec![Value::object(properties)?])
            .await
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.client.call(&PING_METHOD, vec![]).await.map(|_| ())
    }

    pub async fn logoff(&self) -> Result<(), ClientError> {
        self.client.call(&LOGOFF_METHOD, vec![]).await.map(|_| ())
    }
}
