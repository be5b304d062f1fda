//! Line-mode terminal client for a running relay. Renders the conversation
//! from store events, the same surface an embedding UI would consume.

use std::error::Error;
use std::io::{self, Write};

use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

use crate::core::config::WidgetConfig;
use crate::core::store::{ConversationStatus, StoreEvent};
use crate::core::widget::ChatWidget;

pub async fn run_chat(config: WidgetConfig) -> Result<(), Box<dyn Error>> {
    let mut widget = ChatWidget::new(config);
    let mut events = widget.subscribe();

    print_banner(widget.config());

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };

        let outcome = match parse_quick_action(&line, widget.config().quick_actions.len()) {
            Some(index) => {
                let label = widget.config().quick_actions[index].label.clone();
                println!("{label}");
                widget.quick_action(index)
            }
            None => widget.submit_text(&line),
        };
        if !outcome.is_accepted() {
            continue;
        }

        while widget.store().status().is_busy() {
            widget.pump_event().await;
            render_pending(&mut events)?;
        }
        render_pending(&mut events)?;

        if widget.store().status() == ConversationStatus::Error {
            if let Some(error) = widget.store().last_error() {
                eprintln!("\n❌ Error: {error}");
            }
        } else {
            println!();
            if let Some(questions) =
                followup_questions(widget.config(), widget.store().messages().len())
            {
                println!("You could also ask:");
                for question in questions {
                    println!("  • {question}");
                }
            }
        }
    }

    Ok(())
}

fn print_banner(config: &WidgetConfig) {
    println!("{}", config.title);
    println!("{}", config.greeting);
    if !config.quick_actions.is_empty() {
        println!();
        for (i, action) in config.quick_actions.iter().enumerate() {
            match &action.description {
                Some(description) => {
                    println!("  {}. {} ({})", i + 1, action.label, description)
                }
                None => println!("  {}. {}", i + 1, action.label),
            }
        }
    }
    if !config.suggested_questions.is_empty() {
        println!();
        println!("Try asking:");
        for question in &config.suggested_questions {
            println!("  • {question}");
        }
    }
    println!();
    println!("Enter a number to pick an option above, or type a question. Ctrl+D quits.");
}

/// A bare number selects the matching quick action; anything else is a
/// free-form question.
fn parse_quick_action(line: &str, count: usize) -> Option<usize> {
    let index: usize = line.trim().parse().ok()?;
    if (1..=count).contains(&index) {
        Some(index - 1)
    } else {
        None
    }
}

/// Follow-up nudges are offered exactly once, after the first exchange.
fn followup_questions(config: &WidgetConfig, transcript_len: usize) -> Option<&[String]> {
    (transcript_len == 2 && !config.followup_questions.is_empty())
        .then(|| config.followup_questions.as_slice())
}

fn render_pending(
    events: &mut mpsc::UnboundedReceiver<StoreEvent>,
) -> Result<(), Box<dyn Error>> {
    while let Ok(event) = events.try_recv() {
        if let StoreEvent::AssistantDelta { text, .. } = event {
            print!("{text}");
            io::stdout().flush()?;
        }
    }
    Ok(())
}
