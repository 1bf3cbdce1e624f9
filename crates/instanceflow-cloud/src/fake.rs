//! Deterministic in-process cloud backend
//!
//! `FakeCloud` keeps its instances in memory and walks each one through a
//! scripted sequence of states, one step per describe call. Failures can be
//! injected per operation, and every call is counted so tests can assert on
//! provider traffic.

use crate::error::{CloudError, Result};
use crate::instance::{
    CreateInstancesRequest, InstanceDescription, InstanceState, InstanceStateChange,
};
use crate::provider::CloudClient;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

const FIRST_INSTANCE_NUMBER: u64 = 123456;

/// Provider calls observed by the fake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create: usize,
    pub describe: usize,
    pub terminate: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.create + self.describe + self.terminate
    }
}

#[derive(Debug)]
struct FakeInstance {
    region: String,
    /// Front is the current state; it advances after each describe while more than one remains.
    script: VecDeque<InstanceState>,
    public_ip: String,
    private_ip: String,
}

impl FakeInstance {
    fn current(&self) -> InstanceState {
        self.script.front().copied().unwrap_or(InstanceState::Terminated)
    }

    fn advance(&mut self) {
        if self.script.len() > 1 {
            self.script.pop_front();
        }
    }

    fn describe(&self, instance_id: &str) -> InstanceDescription {
        let state = self.current();
        let mut description = InstanceDescription::new(instance_id, state);
        if state == InstanceState::Running {
            description.public_ip = Some(self.public_ip.clone());
            description.public_dns = Some(format!(
                "ec2-{}.compute.amazonaws.com",
                self.public_ip.replace('.', "-")
            ));
        }
        if !state.is_terminal() {
            description.private_ip = Some(self.private_ip.clone());
            description.private_dns = Some(format!(
                "ip-{}.ec2.internal",
                self.private_ip.replace('.', "-")
            ));
        }
        description
    }
}

#[derive(Debug)]
struct FakeState {
    next_number: u64,
    boot_sequence: Vec<InstanceState>,
    shutdown_sequence: Vec<InstanceState>,
    public_ip: String,
    private_ip: String,
    create_failures: u32,
    describe_failures: u32,
    terminate_failures: u32,
    create_returns_nothing: bool,
    describe_returns_nothing: bool,
    instances: BTreeMap<String, FakeInstance>,
    tokens: HashMap<String, String>,
    calls: CallCounts,
    last_request: Option<CreateInstancesRequest>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            next_number: FIRST_INSTANCE_NUMBER,
            boot_sequence: vec![InstanceState::Running],
            shutdown_sequence: vec![InstanceState::ShuttingDown, InstanceState::Terminated],
            public_ip: "1.2.3.4".to_string(),
            private_ip: "10.0.0.1".to_string(),
            create_failures: 0,
            describe_failures: 0,
            terminate_failures: 0,
            create_returns_nothing: false,
            describe_returns_nothing: false,
            instances: BTreeMap::new(),
            tokens: HashMap::new(),
            calls: CallCounts::default(),
            last_request: None,
        }
    }
}

/// In-memory `CloudClient`
///
/// Defaults: the first launched instance is `i-mock123456`, reported as
/// `pending` by the create call and `running` on every describe, with public
/// IP `1.2.3.4` and private IP `10.0.0.1`. A terminate call moves it to
/// `shutting-down`, and the next describe after that reports `terminated`.
#[derive(Debug, Default)]
pub struct FakeCloud {
    state: Mutex<FakeState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// States reported by successive describe calls after launch (the last one sticks)
    pub fn with_boot_sequence(self, states: impl IntoIterator<Item = InstanceState>) -> Self {
        self.lock().boot_sequence = states.into_iter().collect();
        self
    }

    /// States reported by successive describe calls after terminate (the last one sticks)
    pub fn with_shutdown_sequence(self, states: impl IntoIterator<Item = InstanceState>) -> Self {
        self.lock().shutdown_sequence = states.into_iter().collect();
        self
    }

    pub fn with_addresses(self, public_ip: &str, private_ip: &str) -> Self {
        {
            let mut state = self.lock();
            state.public_ip = public_ip.to_string();
            state.private_ip = private_ip.to_string();
        }
        self
    }

    /// Reject the next `count` create calls
    pub fn fail_creates(&self, count: u32) {
        self.lock().create_failures = count;
    }

    /// Reject the next `count` describe calls
    pub fn fail_describes(&self, count: u32) {
        self.lock().describe_failures = count;
    }

    /// Reject the next `count` terminate calls
    pub fn fail_terminates(&self, count: u32) {
        self.lock().terminate_failures = count;
    }

    /// Make create calls succeed without reporting any instance
    pub fn create_returns_nothing(&self, enabled: bool) {
        self.lock().create_returns_nothing = enabled;
    }

    /// Make describe calls succeed without reporting any reservation
    pub fn describe_returns_nothing(&self, enabled: bool) {
        self.lock().describe_returns_nothing = enabled;
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// Number of distinct instances launched so far
    pub fn launched(&self) -> usize {
        self.lock().instances.len()
    }

    pub fn last_create_request(&self) -> Option<CreateInstancesRequest> {
        self.lock().last_request.clone()
    }

    /// Current state of an instance without advancing its script
    pub fn instance_state(&self, instance_id: &str) -> Option<InstanceState> {
        self.lock().instances.get(instance_id).map(FakeInstance::current)
    }

    /// Drop an instance as if it had been removed outside the controller
    pub fn remove_instance(&self, instance_id: &str) -> bool {
        self.lock().instances.remove(instance_id).is_some()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        // A panicking test thread must not take the other tests' fake down with it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

#[async_trait]
impl CloudClient for FakeCloud {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create_instances(
        &self,
        region: &str,
        request: &CreateInstancesRequest,
    ) -> Result<Vec<InstanceDescription>> {
        let mut state = self.lock();
        state.calls.create += 1;
        state.last_request = Some(request.clone());

        if take_failure(&mut state.create_failures) {
            return Err(CloudError::provider_call(
                "RunInstances",
                "InsufficientInstanceCapacity: injected failure",
            ));
        }
        if state.create_returns_nothing {
            return Ok(Vec::new());
        }

        if let Some(token) = &request.client_token {
            if let Some(existing) = state.tokens.get(token).cloned() {
                if let Some(instance) = state.instances.get(&existing) {
                    tracing::debug!(instance_id = %existing, "fake: client token replay");
                    return Ok(vec![instance.describe(&existing)]);
                }
            }
        }

        let instance_id = format!("i-mock{}", state.next_number);
        state.next_number += 1;

        let mut script: VecDeque<InstanceState> = state.boot_sequence.iter().copied().collect();
        if script.is_empty() {
            script.push_back(InstanceState::Pending);
        }
        let instance = FakeInstance {
            region: region.to_string(),
            script,
            public_ip: state.public_ip.clone(),
            private_ip: state.private_ip.clone(),
        };
        state.instances.insert(instance_id.clone(), instance);
        if let Some(token) = &request.client_token {
            state.tokens.insert(token.clone(), instance_id.clone());
        }

        Ok(vec![InstanceDescription::new(
            instance_id,
            InstanceState::Pending,
        )])
    }

    async fn describe_instances(
        &self,
        region: &str,
        instance_id: &str,
    ) -> Result<Vec<InstanceDescription>> {
        let mut state = self.lock();
        state.calls.describe += 1;

        if take_failure(&mut state.describe_failures) {
            return Err(CloudError::provider_call(
                "DescribeInstances",
                "RequestLimitExceeded: injected failure",
            ));
        }
        if state.describe_returns_nothing {
            return Ok(Vec::new());
        }

        match state.instances.get_mut(instance_id) {
            Some(instance) if instance.region == region => {
                let description = instance.describe(instance_id);
                instance.advance();
                Ok(vec![description])
            }
            _ => Err(CloudError::InstanceNotFound(instance_id.to_string())),
        }
    }

    async fn find_by_client_token(
        &self,
        region: &str,
        client_token: &str,
    ) -> Result<Vec<InstanceDescription>> {
        let mut state = self.lock();
        state.calls.describe += 1;

        if take_failure(&mut state.describe_failures) {
            return Err(CloudError::provider_call(
                "DescribeInstances",
                "RequestLimitExceeded: injected failure",
            ));
        }

        let Some(instance_id) = state.tokens.get(client_token).cloned() else {
            return Ok(Vec::new());
        };
        Ok(state
            .instances
            .get(&instance_id)
            .filter(|instance| instance.region == region)
            .map(|instance| instance.describe(&instance_id))
            .into_iter()
            .collect())
    }

    async fn terminate_instances(
        &self,
        region: &str,
        instance_id: &str,
    ) -> Result<Vec<InstanceStateChange>> {
        let mut state = self.lock();
        state.calls.terminate += 1;

        if take_failure(&mut state.terminate_failures) {
            return Err(CloudError::provider_call(
                "TerminateInstances",
                "UnauthorizedOperation: injected failure",
            ));
        }

        let shutdown: VecDeque<InstanceState> = state.shutdown_sequence.iter().copied().collect();
        match state.instances.get_mut(instance_id) {
            Some(instance) if instance.region == region => {
                let previous_state = instance.current();
                if previous_state != InstanceState::Terminated {
                    instance.script = shutdown;
                    if instance.script.is_empty() {
                        instance.script.push_back(InstanceState::Terminated);
                    }
                }
                Ok(vec![InstanceStateChange {
                    instance_id: instance_id.to_string(),
                    previous_state,
                    current_state: instance.current(),
                }])
            }
            _ => Err(CloudError::InstanceNotFound(instance_id.to_string())),
        }
    }
}
