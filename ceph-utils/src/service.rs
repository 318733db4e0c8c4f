// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Starting and stopping the system services that use provisioned storage.

use crate::{BoxedExecutor, ExecutionError, SERVICE};
use std::fmt;
use std::process::Command;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceAction::Start => write!(f, "start"),
            ServiceAction::Stop => write!(f, "stop"),
        }
    }
}

/// Error returned by [`Service::start`] and [`Service::stop`].
#[derive(thiserror::Error, Debug)]
#[error("Failed to {action} service {name}: {err}")]
pub struct ServiceError {
    name: String,
    action: ServiceAction,
    #[source]
    err: ExecutionError,
}

/// Wraps the `service` command.
pub struct Service {}

impl Service {
    pub fn start(executor: &BoxedExecutor, name: &str) -> Result<(), ServiceError> {
        Self::run(executor, name, ServiceAction::Start)
    }

    pub fn stop(executor: &BoxedExecutor, name: &str) -> Result<(), ServiceError> {
        Self::run(executor, name, ServiceAction::Stop)
    }

    fn run(
        executor: &BoxedExecutor,
        name: &str,
        action: ServiceAction,
    ) -> Result<(), ServiceError> {
        let mut command = Command::new(SERVICE);
        let cmd = command.args([name, &action.to_string()]);
        executor.execute(cmd).map_err(|err| ServiceError {
            name: name.to_string(),
            action,
            err,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::{test_log, FakeExecutor, StaticHandler};

    #[test]
    fn test_stop_then_start() {
        let executor = FakeExecutor::new(test_log());
        let mut handler = StaticHandler::new();
        handler.expect_ok("service jetty stop");
        handler.expect_fail("service jetty start");
        handler.register(&executor);
        let executor = executor.as_executor();

        Service::stop(&executor, "jetty").unwrap();
        let err = Service::start(&executor, "jetty").unwrap_err();
        assert!(err.to_string().starts_with("Failed to start service jetty"));
    }
}
