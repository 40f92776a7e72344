//! remote-kernel: run Jupyter kernels on remote hosts and batch schedulers
//!
//! The crate drives prompt-based command sessions (`ssh`, `qsub -I`,
//! `qlogin`, `srun`) on pseudo-terminals until a remote host is granted,
//! starts a kernel there, forwards its five ports back to this machine and
//! keeps the whole arrangement alive.
//!
//! # Features
//!
//! - **Scheduler adapters** for a local shell, plain SSH, PBS, SGE and SLURM
//! - **Credential prompts** answered through `SSH_ASKPASS` or any
//!   [`CredentialSource`]
//! - **Jump-host chains** for both the login and the port tunnel
//! - **Keep-alive supervision** that rebuilds dead tunnels and forwards
//!   interrupts
//! - **Mock processes** for testing (feature: `mock`)
//!
//! # Example
//!
//! ```ignore
//! use remote_kernel::{Interface, LaunchConfig, Launcher};
//!
//! #[tokio::main]
//! async fn main() -> remote_kernel::Result<()> {
//!     let config = LaunchConfig::new(Interface::Slurm).cpus(4).mem("8G");
//!     let mut kernel = Launcher::default().launch(&config, None).await?;
//!     let (mut signals, _handle) = remote_kernel::signals::listen()
//!         .map_err(|e| remote_kernel::RemoteError::io("installing signal handlers", e))?;
//!     let state = kernel.run(&mut signals).await?;
//!     println!("kernel on {} ended: {state}", kernel.host());
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod config;
pub mod connection;
pub mod credential;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod scanner;
pub mod scheduler;
pub mod session;
pub mod signals;
pub mod supervisor;
pub mod template;
pub mod transport;
pub mod tunnel;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use command::CommandLine;
pub use config::{LaunchConfig, Timeouts};
pub use connection::{ConnectionInfo, KernelId, LocalConnectionFile};
pub use credential::{AskPass, CredentialSource};
pub use error::{RemoteError, Result, SpawnError};
pub use logging::LogContext;
pub use orchestrator::{Artifacts, Launcher, RemoteKernel};
pub use scanner::{Prompt, PromptKind, PromptScanner, ReadyMarker};
pub use scheduler::{Interface, ResourceRequest, Scheduler, SchedulerAdapter};
pub use session::InteractiveSession;
pub use signals::HostSignal;
pub use supervisor::{SessionSupervisor, SupervisorState};
pub use template::ServiceTemplate;
pub use transport::{PtySpawner, PtyTransport, Spawner, Transport};
pub use tunnel::{HostSpec, TunnelHealth, TunnelHop, TunnelSet};
