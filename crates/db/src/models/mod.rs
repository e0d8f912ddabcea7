pub mod device_agent;
