use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use fly_api::{CreateMachineRequest, FlyClient, GuestConfig, Machine, MachineConfig, MachineFile};
use rsa::RsaPublicKey;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{BackendConfig, FlyConfig, OperatingSystem, ProviderSettings};
use crate::confirm::{self, ConfirmationPolicy};
use crate::ssh;
use crate::types::{Instance, InstanceId, InstanceState, ResolvedSpec};
use crate::{CloudProvider, Error, ProviderName, Result};

const PROVIDER: ProviderName = ProviderName::Fly;

/// Machine metadata key carrying the machine uid.
pub const UID_METADATA_KEY: &str = "machine-uid";

const AUTHORIZED_KEYS_PATH: &str = "/root/.ssh/authorized_keys";
const USER_DATA_PATH: &str = "/var/lib/cloud/seed/nocloud/user-data";

/// Fly.io Machines API provider.
///
/// Fly has no account-level key registry, so the public key and the
/// bootstrap payload are written into the machine as files.
pub struct FlyProvider {
    api_url: Option<String>,
    confirmation: ConfirmationPolicy,
}

impl FlyProvider {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            api_url: settings.fly_api_url.clone(),
            confirmation: settings.confirmation,
        }
    }

    fn config(spec: &ResolvedSpec) -> Result<(&FlyConfig, OperatingSystem)> {
        match &spec.config.backend {
            BackendConfig::Fly(config) => Ok((config, spec.config.operating_system)),
            other => Err(Error::ConfigDecode(format!(
                "expected a {PROVIDER} config, got {}",
                other.provider()
            ))),
        }
    }

    fn client(&self, config: &FlyConfig) -> FlyClient {
        let client = FlyClient::new(config.resolved_token(), config.app.clone());
        match &self.api_url {
            Some(url) => client.with_base_url(url.clone()),
            None => client,
        }
    }

    fn image(config: &FlyConfig, os: OperatingSystem) -> Option<String> {
        if let Some(image) = config.image.as_ref().filter(|i| !i.is_empty()) {
            return Some(image.clone());
        }
        match os {
            OperatingSystem::Ubuntu => Some("ubuntu:22.04".into()),
            OperatingSystem::Centos => Some("quay.io/centos/centos:stream9".into()),
            OperatingSystem::Coreos | OperatingSystem::Unknown => None,
        }
    }

    fn parse_state(state: &str) -> InstanceState {
        match state {
            "created" | "starting" => InstanceState::Starting,
            "started" => InstanceState::Running,
            _ => InstanceState::Stopped,
        }
    }

    fn has_uid(machine: &Machine, spec: &ResolvedSpec) -> bool {
        machine.name == spec.name
            && machine.state != "destroyed"
            && machine.metadata(UID_METADATA_KEY) == Some(spec.uid.as_str())
    }

    fn instance(app: &str, machine: Machine) -> Instance {
        let address = machine
            .private_ip
            .clone()
            .unwrap_or_else(|| format!("{}.vm.{app}.internal", machine.id));

        Instance {
            id: InstanceId(machine.id),
            state: Self::parse_state(&machine.state),
            name: machine.name,
            addresses: vec![address],
        }
    }

    async fn find_machine(client: &FlyClient, spec: &ResolvedSpec) -> Result<Machine> {
        let machines = match client.list_machines().await {
            Ok(machines) => machines,
            // The app itself is gone, so is every machine in it.
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(Error::transport(PROVIDER, "list machines", e)),
        };

        let mut matches = machines.into_iter().filter(|m| Self::has_uid(m, spec));
        let machine = matches.next().ok_or_else(|| Error::InstanceNotFound {
            provider: PROVIDER,
            uid: spec.uid.clone(),
        })?;
        if matches.next().is_some() {
            warn!(machine = %spec.name, uid = %spec.uid, "fly: several machines carry this uid, using the first");
        }
        Ok(machine)
    }
}

#[async_trait]
impl CloudProvider for FlyProvider {
    fn name(&self) -> ProviderName {
        PROVIDER
    }

    async fn validate(&self, spec: &ResolvedSpec) -> Result<()> {
        let (config, os) = Self::config(spec)?;

        if config.resolved_token().is_empty() {
            return Err(Error::invalid(PROVIDER, "token is missing"));
        }
        if config.app.is_empty() {
            return Err(Error::invalid(PROVIDER, "app is missing"));
        }
        if config.region.is_empty() {
            return Err(Error::invalid(PROVIDER, "region is missing"));
        }
        if !matches!(config.cpu_kind.as_str(), "shared" | "performance") {
            return Err(Error::invalid(
                PROVIDER,
                format!("cpu_kind {:?} must be shared or performance", config.cpu_kind),
            ));
        }
        if config.cpus == 0 {
            return Err(Error::invalid(PROVIDER, "cpus must be at least 1"));
        }
        if config.memory_mb == 0 || config.memory_mb % 256 != 0 {
            return Err(Error::invalid(
                PROVIDER,
                format!("memory_mb {} must be a positive multiple of 256", config.memory_mb),
            ));
        }
        if Self::image(config, os).is_none() {
            return Err(Error::invalid(
                PROVIDER,
                format!("operating system {os} is not supported"),
            ));
        }
        Ok(())
    }

    async fn create(
        &self,
        spec: &ResolvedSpec,
        userdata: &str,
        public_key: &RsaPublicKey,
        cancel: &CancellationToken,
    ) -> Result<Instance> {
        let (config, os) = Self::config(spec)?;
        let image = Self::image(config, os).ok_or_else(|| {
            Error::invalid(PROVIDER, format!("operating system {os} is not supported"))
        })?;

        let mut metadata: HashMap<String, String> = config.metadata.clone().into_iter().collect();
        metadata.insert(UID_METADATA_KEY.into(), spec.uid.to_string());

        let mut files = vec![MachineFile {
            guest_path: AUTHORIZED_KEYS_PATH.into(),
            raw_value: BASE64.encode(format!("{}\n", ssh::authorized_key(public_key)?)),
        }];
        if !userdata.is_empty() {
            files.push(MachineFile {
                guest_path: USER_DATA_PATH.into(),
                raw_value: BASE64.encode(userdata),
            });
        }

        let client = self.client(config);
        let machine = client
            .create_machine(&CreateMachineRequest {
                name: spec.name.clone(),
                region: config.region.clone(),
                config: MachineConfig {
                    image,
                    guest: Some(GuestConfig {
                        cpus: config.cpus,
                        cpu_kind: config.cpu_kind.clone(),
                        memory_mb: config.memory_mb,
                    }),
                    metadata,
                    files,
                    auto_destroy: Some(false),
                },
            })
            .await
            .map_err(|e| {
                if e.is_rejection() {
                    Error::CreateRejected {
                        provider: PROVIDER,
                        name: spec.name.clone(),
                        reason: e.message(),
                    }
                } else {
                    Error::transport(PROVIDER, "create machine", e)
                }
            })?;

        info!(machine_id = %machine.id, machine = %spec.name, uid = %spec.uid, "fly: machine created, waiting for it to be visible");

        let machine_id = machine.id;
        let confirmed = confirm::confirm_creation(
            &self.confirmation,
            cancel,
            || client.get_machine(&machine_id),
            |m: &Machine| Self::has_uid(m, spec),
        )
        .await
        .map_err(|u| u.into_error(PROVIDER, machine_id.clone()))?;

        info!(machine_id = %confirmed.id, machine = %spec.name, "fly: machine fully created");
        Ok(Self::instance(client.app(), confirmed))
    }

    async fn get(&self, spec: &ResolvedSpec) -> Result<Instance> {
        let (config, _) = Self::config(spec)?;
        let client = self.client(config);
        let machine = Self::find_machine(&client, spec).await?;
        Ok(Self::instance(client.app(), machine))
    }

    async fn delete(&self, spec: &ResolvedSpec) -> Result<()> {
        let (config, _) = Self::config(spec)?;
        let client = self.client(config);

        let machine = match Self::find_machine(&client, spec).await {
            Ok(machine) => machine,
            Err(e) if e.is_not_found() => {
                info!(machine = %spec.name, uid = %spec.uid, "fly: machine already deleted");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        client
            .delete_machine(&machine.id)
            .await
            .map_err(|e| Error::transport(PROVIDER, "delete machine", e))?;

        info!(machine_id = %machine.id, machine = %spec.name, "fly: machine destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};
    use wiremock::matchers::{method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    use super::*;
    use crate::ErrorKind;
    use crate::testutil::{KEY_1_AUTHORIZED, test_key};
    use crate::types::{MachineSpec, MachineUid};

    fn provider(server: &MockServer) -> FlyProvider {
        FlyProvider::new(&ProviderSettings {
            confirmation: ConfirmationPolicy {
                interval: Duration::from_millis(10),
                failure_backoff: Duration::from_millis(10),
                timeout: Duration::from_secs(5),
            },
            digitalocean_api_url: None,
            fly_api_url: Some(server.uri()),
        })
    }

    fn spec_with(uid: &str, provider_spec: Value, os: &str) -> ResolvedSpec {
        ResolvedSpec::decode(&MachineSpec {
            name: "worker-0".into(),
            uid: MachineUid(uid.into()),
            provider_config: json!({
                "cloudProvider": "fly",
                "cloudProviderSpec": provider_spec,
                "operatingSystem": os,
            }),
        })
        .unwrap()
    }

    fn spec(uid: &str) -> ResolvedSpec {
        spec_with(
            uid,
            json!({ "token": "fly-token", "app": "workers", "region": "ams", "memory_mb": 512 }),
            "ubuntu",
        )
    }

    fn machine(id: &str, state: &str, uid: &str) -> Value {
        json!({
            "id": id,
            "name": "worker-0",
            "state": state,
            "region": "ams",
            "private_ip": "fdaa:0:1::3",
            "config": { "image": "ubuntu:22.04", "metadata": { "machine-uid": uid } }
        })
    }

    #[tokio::test]
    async fn validate_rejects_bad_sizing_and_os() {
        let server = MockServer::start().await;
        let p = provider(&server);

        p.validate(&spec("uid-a")).await.unwrap();

        let cases = [
            spec_with("u", json!({ "token": "t", "app": "a", "region": "ams", "memory_mb": 300 }), "ubuntu"),
            spec_with("u", json!({ "token": "t", "app": "a", "region": "ams", "cpus": 0 }), "ubuntu"),
            spec_with("u", json!({ "token": "t", "app": "a", "region": "ams", "cpu_kind": "dedicated" }), "ubuntu"),
            spec_with("u", json!({ "token": "t", "region": "ams" }), "ubuntu"),
            spec_with("u", json!({ "token": "t", "app": "a", "region": "ams" }), "coreos"),
        ];
        for spec in cases {
            let err = p.validate(&spec).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidSpec, "{err}");
        }

        // An explicit image makes any operating system acceptable.
        let custom = spec_with(
            "u",
            json!({ "token": "t", "app": "a", "region": "ams", "image": "registry.fly.io/coreos:1" }),
            "coreos",
        );
        p.validate(&custom).await.unwrap();

        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_injects_key_and_userdata_and_waits_until_visible() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/apps/workers/machines"))
            .respond_with(ResponseTemplate::new(200).set_body_json(machine("m1", "created", "uid-a")))
            .expect(1)
            .mount(&server)
            .await;
        // Not visible yet on the first describe.
        Mock::given(method("GET"))
            .and(path("/apps/workers/machines/m1"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "error": "not found" })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/apps/workers/machines/m1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(machine("m1", "started", "uid-a")))
            .mount(&server)
            .await;

        let instance = provider(&server)
            .create(
                &spec("uid-a"),
                "#cloud-config\n",
                &test_key(0).to_public_key(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(instance.id, InstanceId("m1".into()));
        assert_eq!(instance.state, InstanceState::Running);

        let requests = server.received_requests().await.unwrap();
        let create: &Request = requests
            .iter()
            .find(|r| r.method.as_str() == "POST")
            .unwrap();
        let body: Value = serde_json::from_slice(&create.body).unwrap();
        let config = &body["config"];
        assert_eq!(config["image"], "ubuntu:22.04");
        assert_eq!(config["metadata"]["machine-uid"], "uid-a");
        assert_eq!(config["guest"]["memory_mb"], 512);

        let files = config["files"].as_array().unwrap();
        let decoded = |guest_path: &str| {
            let file = files.iter().find(|f| f["guest_path"] == guest_path).unwrap();
            let raw = BASE64.decode(file["raw_value"].as_str().unwrap()).unwrap();
            String::from_utf8(raw).unwrap()
        };
        assert_eq!(decoded(AUTHORIZED_KEYS_PATH).trim(), KEY_1_AUTHORIZED.trim());
        assert_eq!(decoded(USER_DATA_PATH), "#cloud-config\n");
    }

    #[tokio::test]
    async fn rejected_create_is_not_confirmed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/apps/workers/machines"))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(json!({ "error": "invalid image" })),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/apps/workers/machines/.+$"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = provider(&server)
            .create(&spec("uid-a"), "", &test_key(0).to_public_key(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CreateRejected);
        assert!(err.to_string().contains("invalid image"));
    }

    #[tokio::test]
    async fn server_errors_on_create_are_transport_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/apps/workers/machines"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = provider(&server)
            .create(&spec("uid-a"), "", &test_key(0).to_public_key(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendTransport);
        assert!(err.kind().is_retryable());
    }

    #[tokio::test]
    async fn get_ignores_machines_of_other_uids_and_destroyed_ones() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apps/workers/machines"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                machine("m-old", "destroyed", "uid-a"),
                machine("m-other", "started", "uid-b"),
                machine("m-mine", "starting", "uid-a"),
            ])))
            .mount(&server)
            .await;
        let p = provider(&server);

        let instance = p.get(&spec("uid-a")).await.unwrap();
        assert_eq!(instance.id, InstanceId("m-mine".into()));
        assert_eq!(instance.state, InstanceState::Starting);

        let err = p.get(&spec("uid-z")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_forces_removal_and_tolerates_absence() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apps/workers/machines"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([machine("m1", "started", "uid-a")])),
            )
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/apps/workers/machines/m1"))
            .and(query_param("force", "true"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let p = provider(&server);

        p.delete(&spec("uid-a")).await.unwrap();
        // Nothing carries this uid, so no DELETE is sent.
        p.delete(&spec("uid-gone")).await.unwrap();
    }

    #[test]
    fn every_machine_state_maps_to_a_state() {
        let cases = [
            ("created", InstanceState::Starting),
            ("starting", InstanceState::Starting),
            ("started", InstanceState::Running),
            ("stopping", InstanceState::Stopped),
            ("stopped", InstanceState::Stopped),
            ("suspended", InstanceState::Stopped),
            ("replacing", InstanceState::Stopped),
            ("destroyed", InstanceState::Stopped),
            ("failed", InstanceState::Stopped),
            ("", InstanceState::Stopped),
        ];
        for (state, expected) in cases {
            assert_eq!(FlyProvider::parse_state(state), expected, "{state:?}");
        }
    }
}
