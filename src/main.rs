use vau::engine::{ground_environment, unparse::unparse, Context};
use vau::env::Environment;
use vau::parser::Parser;
use std::io::{self, Write};

fn main() {
    println!("vau REPL");
    println!("Type (exit) or Ctrl+C to quit.");

    let mut ctx = Context::new(Environment::new());
    let ground = ground_environment(&mut ctx.arena);
    ctx.record = ground.clone();

    // Standard library (prelude).
    let prelude = [
        "($def! $quote ($vau (x) #ignore x))",
        "($def! id ($lambda (x) x))",
        "($def! get-current-environment ($vau () e e))",
    ];

    for code in prelude {
        let mut p = Parser::new(code);
        match p.parse_term(&mut ctx.arena) {
            Ok(term) => {
                ctx.record = ground.clone();
                if let Err(e) = ctx.rewrite_term(term) {
                    println!("Failed to load prelude form: {e}");
                }
            }
            Err(e) => println!("Failed to parse prelude form: {e}"),
        }
    }

    loop {
        print!("> ");
        io::stdout().flush().ok();

        // Multi-line input: accumulate until parentheses are balanced.
        let mut input = String::new();
        let mut paren_depth = 0i32;
        let mut in_comment = false;

        loop {
            let mut line = String::new();
            match io::stdin().read_line(&mut line) {
                Ok(0) => {
                    if input.is_empty() {
                        return;
                    }
                    break;
                }
                Ok(_) => {}
                Err(_) => return,
            }

            if input.is_empty() {
                let trimmed = line.trim();
                if trimmed == "(exit)" || trimmed == "exit" {
                    return;
                }
                if trimmed.is_empty() || trimmed.starts_with(';') {
                    break;
                }
            }

            for c in line.chars() {
                match c {
                    ';' => in_comment = true,
                    '\n' => in_comment = false,
                    '(' if !in_comment => paren_depth += 1,
                    ')' if !in_comment => paren_depth -= 1,
                    _ => {}
                }
            }
            in_comment = false;

            input.push_str(&line);

            if paren_depth <= 0 {
                break;
            }

            print!("  ");
            io::stdout().flush().ok();
        }

        if input.trim().is_empty() {
            continue;
        }

        let mut parser = Parser::new(&input);
        while parser.has_more() {
            let term = match parser.parse_term(&mut ctx.arena) {
                Ok(term) => term,
                Err(e) => {
                    println!("Parse error: {e}");
                    break;
                }
            };
            ctx.record = ground.clone();
            match ctx.rewrite_term(term) {
                Ok(_) => println!("= {}", unparse(&ctx.arena, term)),
                Err(e) => {
                    println!("Error: {e}");
                    let mut source = std::error::Error::source(&e);
                    while let Some(inner) = source {
                        println!("  caused by: {inner}");
                        source = inner.source();
                    }
                }
            }
        }
    }
}
