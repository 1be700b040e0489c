//! Test utilities for usb-remote
//!
//! Provides a scripted [`CommandRunner`] and canned `usbip` output so the
//! registry, dispatcher and port parser can be tested without root or USB
//! hardware.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockRunner, SAMPLE_LIST_OUTPUT};
//! use common::{CommandOutput, UsbipSettings, UsbipTool};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let runner = Arc::new(MockRunner::new());
//! runner.push_output("list", CommandOutput::ok(SAMPLE_LIST_OUTPUT));
//!
//! let tool = UsbipTool::new(UsbipSettings::default(), runner.clone());
//! let text = tool.list_local().await.unwrap();
//! assert!(text.contains("2e8a:000a"));
//! assert_eq!(runner.calls_for("list").len(), 1);
//! # }
//! ```

use crate::Result;
use crate::usbip::{CommandOutput, CommandRunner};
use async_trait::async_trait;
use protocol::UsbDevice;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// `usbip list -l` output for a Raspberry Pi Pico and an FTDI adapter
pub const SAMPLE_LIST_OUTPUT: &str = "\
 - busid 1-1.1 (2e8a:000a)
   Raspberry Pi : unknown product (2e8a:000a)

 - busid 1-1.2 (0403:6001)
   Future Technology Devices International, Ltd : FT232 Serial (UART) IC (0403:6001)

";

/// `usbip port` output with the Pico from 192.168.1.30 imported on port 0
pub const SAMPLE_PORT_OUTPUT: &str = "\
Imported USB devices
====================
Port 00: <Port in Use> at Full Speed(12Mbps)
       Raspberry Pi : unknown product (2e8a:000a)
       3-1 -> usbip://192.168.1.30:3240/1-1.1
           -> remote bus/dev 001/004
";

/// `usbip port` output when nothing is imported
pub const EMPTY_PORT_OUTPUT: &str = "\
Imported USB devices
====================
";

const SUBCOMMANDS: [&str; 6] = ["list", "bind", "unbind", "attach", "detach", "port"];

/// Scripted stand-in for [`crate::SystemRunner`]
///
/// Outputs are queued per usbip subcommand. The last queued output for a
/// subcommand is sticky; a subcommand with nothing queued succeeds with
/// empty stdout.
#[derive(Debug, Default)]
pub struct MockRunner {
    calls: Mutex<Vec<Vec<String>>>,
    outputs: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
    delay: Mutex<Option<Duration>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an output for a subcommand (`list`, `bind`, `port`, ...)
    pub fn push_output(&self, subcommand: &str, output: CommandOutput) {
        let mut outputs = self.outputs.lock().unwrap();
        outputs
            .entry(subcommand.to_string())
            .or_default()
            .push_back(output);
    }

    /// Make every invocation take this long before answering
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Every command line seen so far, program first
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Command lines for one subcommand
    pub fn calls_for(&self, subcommand: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|call| subcommand_of(call) == Some(subcommand))
            .collect()
    }

    fn next_output(&self, subcommand: Option<&str>) -> CommandOutput {
        let Some(subcommand) = subcommand else {
            return CommandOutput::ok("");
        };
        let mut outputs = self.outputs.lock().unwrap();
        match outputs.get_mut(subcommand) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| CommandOutput::ok("")),
            None => CommandOutput::ok(""),
        }
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        _timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut call = vec![program.to_string()];
        call.extend(args.iter().cloned());
        let output = self.next_output(subcommand_of(&call));
        self.calls.lock().unwrap().push(call);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(output)
    }
}

fn subcommand_of(call: &[String]) -> Option<&'static str> {
    call.iter()
        .find_map(|arg| SUBCOMMANDS.iter().find(|s| **s == arg.as_str()).copied())
}

/// Create a mock UsbDevice for testing
///
/// # Example
/// ```
/// use common::test_utils::create_mock_device;
///
/// let device = create_mock_device("1-1.1", 0x2e8a, 0x000a, "Raspberry Pi");
/// assert_eq!(device.id(), "2e8a:000a");
/// ```
pub fn create_mock_device(
    bus_id: &str,
    vendor_id: u16,
    product_id: u16,
    description: &str,
) -> UsbDevice {
    UsbDevice {
        vendor_id,
        product_id,
        bus_id: bus_id.to_string(),
        serial: None,
        description: description.to_string(),
    }
}

/// Run a future with a timeout, panicking if it does not finish in time
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .expect("Test timed out")
}
