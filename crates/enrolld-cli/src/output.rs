use anyhow::Result;
use enrolld_manager::DeviceState;

pub fn print_state(state: &DeviceState, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(state)?);
        return Ok(());
    }

    let or_dash = |s: &str| {
        if s.is_empty() {
            "-".to_string()
        } else {
            s.to_string()
        }
    };

    println!("brand:    {}", or_dash(&state.identity.brand));
    println!("model:    {}", or_dash(&state.identity.model));
    println!("serial:   {}", or_dash(&state.identity.serial));
    println!("key-id:   {}", or_dash(&state.identity.key_id));
    println!("seeded:   {}", state.seeded);
    match &state.attempt.last_attempt_at {
        Some(at) => println!(
            "attempts: {} (last at {}, next backoff {}m)",
            state.attempt.attempt_count, at, state.attempt.next_backoff_mins
        ),
        None => println!("attempts: 0"),
    }
    Ok(())
}
