pub mod fswatch;
pub mod k8s;
pub mod npu;
