//! epsp-node: peer links, the directory client and the swarm node that
//! drives them.

pub mod conn;
pub mod directory;
pub mod error;
pub mod identity;
pub mod node;
pub mod peer;
pub mod registry;

pub use error::{ConnError, DirectoryError, DispatchError, NodeError, PeerError, StoreError};
pub use identity::{IdentityStore, JsonFileStore, MemoryStore, NodeIdentity, SigningKey, StoredIdentity};
pub use node::{Disposition, Message, MessageHandler, Node, NodeConfig, NodeSnapshot};
pub use peer::{Direction, PeerConnection, PeerSnapshot, PeerState};
pub use registry::PeerRegistry;
