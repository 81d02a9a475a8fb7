pub mod certificates;
pub mod compute;
pub mod control_plane;
pub mod encryption;
pub mod environment;
pub mod etcd;
pub mod kubeconfigs;
pub mod networking;
pub mod workers;

pub use certificates::Certificates;
pub use compute::Compute;
pub use control_plane::ControlPlane;
pub use encryption::Encryption;
pub use environment::Environment;
pub use etcd::Etcd;
pub use kubeconfigs::Kubeconfigs;
pub use networking::Networking;
pub use workers::Workers;
