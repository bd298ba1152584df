//! Operator commands for brute-force dictionaries.

use std::path::PathBuf;

use anyhow::{Context, Result};
use sqlx::PgPool;

use stellar_db::queries::dictionaries;

use crate::DictCommands;

pub async fn run_dict_command(command: DictCommands, pool: &PgPool) -> Result<()> {
    match command {
        DictCommands::Add { name, file } => {
            let words = read_wordlist(&file)?;
            if words.is_empty() {
                anyhow::bail!("{} contains no usable words", file.display());
            }
            let dictionary = dictionaries::upsert_dictionary(pool, &name, &words).await?;
            println!(
                "Dictionary {} saved with {} words.",
                dictionary.name,
                dictionary.words.len()
            );
        }
        DictCommands::List => {
            let listed = dictionaries::list_dictionaries(pool).await?;
            println!("{:<30} WORDS", "NAME");
            for (name, count) in &listed {
                println!("{name:<30} {count}");
            }
            if listed.is_empty() {
                println!("\nNo dictionaries stored.");
            }
        }
        DictCommands::Remove { name } => {
            let removed = dictionaries::delete_dictionary(pool, &name).await?;
            if removed == 0 {
                anyhow::bail!("dictionary {name:?} not found");
            }
            println!("Dictionary {name} removed.");
        }
    }
    Ok(())
}

fn read_wordlist(path: &PathBuf) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read wordlist {}", path.display()))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_owned)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wordlist_parsing_skips_comments() {
        let dir = std::env::temp_dir().join(format!("stellar-dict-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("words.txt");
        std::fs::write(&path, "# header\nwww\n\n  mail  \n#skip\napi\n").unwrap();

        let words = read_wordlist(&path).unwrap();
        assert_eq!(words, vec!["www", "mail", "api"]);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
