pub mod comm;
pub mod config;
pub mod error;
pub mod queue;
pub mod rpc;
pub mod tensor;

pub use comm::{
    init_async, init_geo, instance, AsyncCommunicator, CommStatus, Communicator, GeoCommunicator,
    SparseIdsMap,
};
pub use config::CommConfig;
pub use error::ParamsyncError;
pub use queue::SendQueue;
pub use rpc::client::{RpcClient, WaitHandle};
pub use rpc::loopback::LoopbackClient;
pub use rpc::{CommContext, RpcCtxMap, VarInfo};
pub use tensor::{DenseTensor, Scope, SparseRows, Variable};
