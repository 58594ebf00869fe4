use std::io::{self, Write};
use std::str::FromStr;

pub fn show_menu(connected: bool) {
    println!("\n===========================================");
    println!("Thermal Lab Console");
    println!("===========================================");
    println!(
        "Link: {}",
        if connected { "connected" } else { "not connected" }
    );
    println!("Select an option:");
    println!("1. Connect to serial port");
    println!("2. Connect to simulated rig");
    println!("3. Run a procedure");
    println!("4. Export last run");
    println!("5. Link diagnostics");
    println!("6. Disconnect");
    println!("7. Exit");
    println!("===========================================");
    print!("Choice (1-7): ");
    let _ = io::stdout().flush();
}

pub fn show_procedures() {
    println!("\nProcedures:");
    println!("1. Short capture (11 s, 1 Hz)");
    println!("2. Slow capture (120 s, 0.5 Hz)");
    println!("3. Resistive sensors (1 h, PWM preset)");
    println!("4. Time response (10 min, filter off)");
    println!("5. Temperature regulation (1 h, PI control)");
    print!("Choice (1-5): ");
    let _ = io::stdout().flush();
}

/// `UnexpectedEof` once stdin is closed, `InvalidInput` for anything but a number.
pub fn get_user_choice() -> io::Result<u32> {
    let mut input = String::new();
    if io::stdin().read_line(&mut input)? == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    input
        .trim()
        .parse::<u32>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Prompt until the answer parses; an empty answer takes `default`.
pub fn prompt<T>(label: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
{
    loop {
        print!("{label} [{default}]: ");
        let _ = io::stdout().flush();
        let answer = read_line();
        let answer = answer.trim();
        if answer.is_empty() {
            return default;
        }
        match answer.parse() {
            Ok(value) => return value,
            Err(_) => println!("'{answer}' is not a valid value."),
        }
    }
}

pub fn prompt_text(label: &str, default: &str) -> String {
    print!("{label} [{default}]: ");
    let _ = io::stdout().flush();
    let answer = read_line();
    match answer.trim() {
        "" => default.to_string(),
        other => other.to_string(),
    }
}

pub fn confirm(label: &str) -> bool {
    print!("{label} (y/N): ");
    let _ = io::stdout().flush();
    matches!(read_line().trim(), "y" | "Y" | "yes")
}

pub fn wait_for_enter() {
    println!("\nPress Enter to return to menu...");
    read_line();
}

fn read_line() -> String {
    let mut input = String::new();
    // EOF reads as an empty answer
    let _ = io::stdin().read_line(&mut input);
    input
}
