mod device_agent_repo;

pub use device_agent_repo::DeviceAgentRepo;
