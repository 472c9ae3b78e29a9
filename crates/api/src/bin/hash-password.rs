//! Bootstrap helper for the first LineDesk administrator
//!
//! Hashes a password with Argon2id and prints the SQL that creates an admin
//! account with it.
//!
//! Usage:
//!   hash-password                      # prompts for the password
//!   hash-password "S3cure-pass" admin@example.com "Главный администратор"

use std::env;
use std::io::{self, Write};

use linedesk_api::auth::{hash_password, validate_password_strength};

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn main() -> anyhow::Result<()> {
    let mut args = env::args().skip(1);

    let password = match args.next() {
        Some(pwd) => pwd,
        None => {
            // Reading from stdin keeps the password out of the process list
            print!("Enter password to hash: ");
            io::stdout().flush()?;

            let mut password = String::new();
            io::stdin().read_line(&mut password)?;
            password.trim().to_string()
        }
    };
    let email = args.next().unwrap_or_else(|| "admin@example.com".to_string());
    let full_name = args.next().unwrap_or_else(|| "Administrator".to_string());

    if password.is_empty() {
        anyhow::bail!("password cannot be empty");
    }
    if let Err(e) = validate_password_strength(&password) {
        anyhow::bail!("password rejected: {}", e);
    }

    let password_hash = hash_password(&password)?;

    println!("{}", password_hash);
    println!();
    println!("-- Create the administrator:");
    println!(
        "INSERT INTO users (email, password_hash, full_name, role_id)\n\
         SELECT {}, {}, {}, id FROM roles WHERE name = 'admin';",
        sql_literal(&email.trim().to_lowercase()),
        sql_literal(&password_hash),
        sql_literal(full_name.trim()),
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_literal_escapes_quotes() {
        assert_eq!(sql_literal("O'Brien"), "'O''Brien'");
        assert_eq!(sql_literal("plain"), "'plain'");
    }
}
