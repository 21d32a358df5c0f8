//! Peer-deployment metadata: a plain data bag piggybacked on requests.
//!
//! The source system supports shipping not-yet-deployed user classes
//! alongside a request (peer class loading); this is reduced here to
//! an opaque descriptor with no attempt to mirror dynamic code loading
//! in Rust.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// How (if at all) peer deployment applies to a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentMode {
    /// No peer deployment; the updater is assumed already present on
    /// every node (the common case for a statically linked cluster).
    Disabled,
    /// Peer deployment is active; the descriptor's fields are
    /// meaningful and should be propagated with the request.
    Enabled,
}

/// Opaque metadata identifying which user class/version produced a
/// request, and which nodes participate in its deployment.
///
/// Carried verbatim on [`LoadRequest`](https://docs.rs/gridstream);
/// `gridstream` does not interpret these fields beyond forwarding them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentDescriptor {
    /// Deployment mode for this request.
    pub mode: DeploymentMode,
    /// Fully-qualified name of the user class associated with the
    /// updater, as reported by the deployment collaborator.
    pub class_name: SmolStr,
    /// User-assigned version string for the deployed class.
    pub user_version: SmolStr,
    /// Nodes that are expected to already have this class loaded.
    pub participants: Vec<gridstream_core::NodeId>,
    /// Opaque id of the class loader that produced `class_name`, used by
    /// the remote peer to decide whether a redeploy is necessary.
    pub class_loader_id: SmolStr,
}

impl DeploymentDescriptor {
    /// The disabled default: no peer deployment metadata.
    pub fn disabled() -> Self {
        Self {
            mode: DeploymentMode::Disabled,
            class_name: SmolStr::new_static(""),
            user_version: SmolStr::new_static(""),
            participants: Vec::new(),
            class_loader_id: SmolStr::new_static(""),
        }
    }
}

/// Externalises the source's `cls0 == null || isJdk(cls0)` heuristic for
/// picking a deployment class when none is explicitly configured.
///
/// The source never defines what "JDK class" means precisely (classpath
/// origin? package prefix?); this implementation does not guess —
/// callers that care about peer deployment must supply their own
/// predicate.
pub trait DeploymentClassPredicate: Send + Sync {
    /// Returns `true` if `class_name` should be treated as platform code
    /// that never needs peer deployment (e.g. a builtin updater).
    fn is_platform_class(&self, class_name: &str) -> bool;
}

/// A predicate that treats every class as user code, i.e. always
/// requires deployment metadata when [`DeploymentMode::Enabled`].
pub struct AlwaysUserClass;

impl DeploymentClassPredicate for AlwaysUserClass {
    fn is_platform_class(&self, _class_name: &str) -> bool {
        false
    }
}
