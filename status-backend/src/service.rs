//! Namespaced RPC services
//!
//! The backend groups its RPC methods by service: `wallet_*`, `accounts_*`,
//! `wakuext_*`...

use serde_json::Value;

use crate::rpc::{Error, HttpResponse, RpcClient};

#[derive(Debug, Clone)]
pub struct Service {
    rpc_client: RpcClient,
    name: &'static str,
}

impl Service {
    pub fn new(rpc_client: RpcClient, name: &'static str) -> Self {
        assert!(!name.is_empty(), "service name must not be empty");
        Self { rpc_client, name }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn method_name(&self, method: &str) -> String {
        format!("{}_{}", self.name, method)
    }

    pub fn rpc_request(&self, method: &str, params: &[Value]) -> Result<HttpResponse, Error> {
        self.rpc_client
            .rpc_request(&self.method_name(method), params, None)
    }
}

#[derive(Debug, Clone)]
pub struct WalletService {
    service: Service,
}

impl WalletService {
    pub fn new(rpc_client: RpcClient) -> Self {
        Self {
            service: Service::new(rpc_client, "wallet"),
        }
    }

    pub fn get_balances_at_by_chain(
        &self,
        chains: &[u64],
        addresses: &[&str],
        tokens: &[&str],
    ) -> Result<HttpResponse, Error> {
        let params = [
            serde_json::json!(chains),
            serde_json::json!(addresses),
            serde_json::json!(tokens),
        ];
        self.service.rpc_request("getBalancesByChain", &params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names_are_prefixed() {
        let service = Service::new(RpcClient::new("http://127.0.0.1:3333"), "accounts");
        assert_eq!(service.name(), "accounts");
        assert_eq!(service.method_name("getKeypairs"), "accounts_getKeypairs");
    }

    #[test]
    #[should_panic]
    fn empty_service_name() {
        Service::new(RpcClient::new("http://127.0.0.1:3333"), "");
    }
}
