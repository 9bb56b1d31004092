//! Core module - application ids, the registry, instances and observers

pub mod appid;
pub mod application;
pub mod environment;
pub mod error;
pub mod helper;
pub mod instance;
pub mod observer;
pub mod oom;
pub mod registry;
pub mod settings;
mod watcher;
mod worker;

pub use appid::{AppId, ApplicationWildcard};
pub use application::Application;
pub use error::{Error, Result};
pub use helper::{Helper, HelperType};
pub use instance::{Instance, InstanceState};
pub use observer::{DeliveryContext, EventLoop, ObserverBus, Signal, SubscriptionId};
pub use oom::OomScore;
pub use registry::{Registry, RegistryBuilder};
pub use settings::{LaunchConfig, SupervisorFlavor};
