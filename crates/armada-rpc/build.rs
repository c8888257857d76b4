use tonic_build::manual::{Builder, Method, Service};

/// (rust name, route name, request type, response type)
const METHODS: &[(&str, &str, &str, &str)] = &[
    ("status", "Status", "Empty", "HealthResponse"),
    ("get_units", "GetUnits", "Empty", "UnitsResponse"),
    ("get_unit", "GetUnit", "UnitName", "UnitResponse"),
    ("get_scheduled_units", "GetScheduledUnits", "Empty", "ScheduleResponse"),
    ("get_scheduled_unit", "GetScheduledUnit", "UnitName", "ScheduledUnitResponse"),
    ("get_unit_states", "GetUnitStates", "Empty", "UnitStatesResponse"),
    ("create_unit", "CreateUnit", "CreateUnitRequest", "Empty"),
    ("destroy_unit", "DestroyUnit", "UnitName", "Empty"),
    ("set_unit_target_state", "SetUnitTargetState", "TargetStateRequest", "Empty"),
    ("schedule_unit", "ScheduleUnit", "ScheduleRequest", "Empty"),
    ("unschedule_unit", "UnscheduleUnit", "ScheduleRequest", "Empty"),
    ("unit_heartbeat", "UnitHeartbeat", "HeartbeatRequest", "Empty"),
    ("clear_unit_heartbeat", "ClearUnitHeartbeat", "UnitName", "Empty"),
    ("save_unit_state", "SaveUnitState", "SaveStateRequest", "Empty"),
    ("remove_unit_state", "RemoveUnitState", "UnitName", "Empty"),
];

fn main() {
    let mut service = Service::builder().name("RegistryService").package("armada");
    for (name, route, input, output) in METHODS {
        service = service.method(
            Method::builder()
                .name(name)
                .route_name(route)
                .input_type(format!("crate::messages::{input}"))
                .output_type(format!("crate::messages::{output}"))
                .codec_path("crate::codec::JsonCodec")
                .build(),
        );
    }
    Builder::new().compile(&[service.build()]);
}
